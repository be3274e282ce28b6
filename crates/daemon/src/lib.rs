//! IPTV Transcode Daemon
//!
//! Real-time transcoding proxy: pulls a live source through ffmpeg, with
//! hardware acceleration where available, and streams the buffered output
//! to HTTP clients.

pub mod buffer;
pub mod daemon;
pub mod hardware;
pub mod metrics;
pub mod server;
pub mod session;
pub mod startup;
pub mod transcode;

pub use buffer::{BufferConfig, BufferError, BufferManager, BufferStats, RetryManager, RingBuffer};
pub use daemon::{discover_hardware, Daemon, DaemonError};
pub use hardware::{
    CompatibilityError, Detector, HardwareCatalog, HardwareDevice, HardwareSelector, SelectionError,
};
pub use iptv_transcode_config as config;
pub use iptv_transcode_config::{Config, HardwareKind, HardwareSpec, TranscodeMode};
pub use metrics::{new_shared_metrics, MetricsSnapshot, SharedMetrics};
pub use server::{create_router, run_server, AppState, ErrorResponse, ServerError};
pub use session::{
    validate_source_url, StreamError, StreamSession, StreamSettings, StreamTranscoder,
};
pub use startup::{check_tool, parse_ffmpeg_version, run_startup_checks, StartupError};
pub use transcode::{
    build_command_args, build_profile, probe_stream, StreamInfo, TranscodeError, Transcoder,
    TranscoderOptions, TranscodingProfile,
};
