//! Encoding profile resolution and the encoder process

pub mod ffmpeg;
pub mod probe;
pub mod profile;
pub mod quality;

pub use ffmpeg::{
    build_command_args, CloseError, TranscodeError, Transcoder, TranscoderOptions, TranscoderState,
};
pub use probe::{parse_ffprobe_output, probe_stream, ProbeError, StreamInfo};
pub use profile::{
    apply_adaptive, apply_hardware, build_profile, calculate_adaptive_bitrate, TranscodingProfile,
    ADAPTIVE,
};
