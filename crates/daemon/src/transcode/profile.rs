//! Transcoding profile construction
//!
//! A profile is resolved once per stream request from the transcode settings,
//! optionally refined by a source probe and by the selected hardware, and then
//! handed to the encoder process unchanged.

use crate::config::{AudioCodec, HardwareKind, Quality, TranscodeConfig, TranscodeMode, VideoCodec};
use crate::hardware::HardwareDevice;
use crate::transcode::probe::StreamInfo;
use crate::transcode::quality;
use serde::Serialize;

/// Bitrate sentinel that defers the choice to a source probe
pub const ADAPTIVE: &str = "adaptive";

/// Output container, always MPEG transport stream
pub const CONTAINER_MPEGTS: &str = "mpegts";

/// Audio bitrate used when the source does not report one (kbps)
pub const DEFAULT_AUDIO_KBPS: u64 = 128;

/// Ceiling for adaptive audio bitrate (kbps)
pub const MAX_AUDIO_KBPS: u64 = 320;

/// Flags that only make sense for software encoders and are dropped once a
/// GPU encoder takes over.
const SOFTWARE_TUNING_FLAGS: &[&str] = &[
    "-c:v",
    "-preset",
    "-tune",
    "-profile:v",
    "-level",
    "-pix_fmt",
    "-deadline",
    "-cpu-used",
];

/// Resolution tiers as (minimum pixel count, base kbps), highest first
const RESOLUTION_TIERS: &[(u64, u64)] = &[
    (3840 * 2160, 15000),
    (2560 * 1440, 10000),
    (1920 * 1080, 5000),
    (1280 * 720, 2500),
    (854 * 480, 1500),
];

const FALLBACK_VIDEO_KBPS: u64 = 800;

/// Resolved encoding parameters for one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscodingProfile {
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    /// Empty for copy, `"adaptive"` until a probe resolves it
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub acceleration: HardwareKind,
    pub container: String,
    pub extra_arguments: Vec<String>,
}

impl TranscodingProfile {
    pub fn is_copy(&self) -> bool {
        self.video_codec == VideoCodec::Copy && self.audio_codec == AudioCodec::Copy
    }

    pub fn is_adaptive(&self) -> bool {
        self.video_bitrate == ADAPTIVE || self.audio_bitrate == ADAPTIVE
    }

    /// Codec and bitrate flags followed by the extra arguments
    ///
    /// These are the profile's own opinion; the encoder command drops any flag
    /// the hardware selector already supplied.
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec![
            "-c:v".to_string(),
            software_video_encoder(self.video_codec).to_string(),
        ];
        if let Some(rate) =
            effective_bitrate(&self.video_bitrate, self.video_codec == VideoCodec::Copy)
        {
            args.push("-b:v".to_string());
            args.push(rate.to_string());
        }
        args.push("-c:a".to_string());
        args.push(audio_encoder(self.audio_codec).to_string());
        if let Some(rate) =
            effective_bitrate(&self.audio_bitrate, self.audio_codec == AudioCodec::Copy)
        {
            args.push("-b:a".to_string());
            args.push(rate.to_string());
        }
        args.extend(self.extra_arguments.iter().cloned());
        args
    }
}

/// The bitrate to pass on the command line, if any
pub fn effective_bitrate(bitrate: &str, codec_is_copy: bool) -> Option<&str> {
    let bitrate = bitrate.trim();
    if codec_is_copy || bitrate.is_empty() || bitrate == ADAPTIVE {
        None
    } else {
        Some(bitrate)
    }
}

/// Software encoder name for a video codec
pub fn software_video_encoder(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "libx264",
        VideoCodec::H265 => "libx265",
        VideoCodec::Vp9 => "libvpx-vp9",
        VideoCodec::Mpeg2 => "mpeg2video",
        VideoCodec::Copy => "copy",
    }
}

/// Encoder name for an audio codec; independent of hardware
pub fn audio_encoder(codec: AudioCodec) -> &'static str {
    match codec {
        AudioCodec::Aac => "aac",
        AudioCodec::Mp3 => "libmp3lame",
        AudioCodec::Mp2 => "mp2",
        AudioCodec::Opus => "libopus",
        AudioCodec::Copy => "copy",
    }
}

/// Flags that keep the encoder alive across corrupt packets and dropped
/// connections, plus transport stream muxing options.
pub fn resilience_arguments() -> Vec<String> {
    [
        "-err_detect",
        "ignore_err",
        "-fflags",
        "+genpts+discardcorrupt+nobuffer",
        "-analyzeduration",
        "10M",
        "-probesize",
        "10M",
        "-max_delay",
        "5000000",
        "-reconnect",
        "1",
        "-reconnect_at_eof",
        "1",
        "-reconnect_streamed",
        "1",
        "-reconnect_delay_max",
        "5",
        "-f",
        CONTAINER_MPEGTS,
        "-mpegts_copyts",
        "1",
        "-avoid_negative_ts",
        "disabled",
        "-max_muxing_queue_size",
        "1024",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn video_tuning_arguments(codec: VideoCodec) -> &'static [&'static str] {
    match codec {
        VideoCodec::Mpeg2 => &[
            "-c:v", "mpeg2video", "-maxrate", "8000k", "-bufsize", "4000k", "-g", "15", "-bf", "2",
            "-pix_fmt", "yuv420p",
        ],
        VideoCodec::H264 => &[
            "-c:v", "libx264", "-preset", "medium", "-profile:v", "high", "-level", "4.1",
            "-pix_fmt", "yuv420p",
        ],
        VideoCodec::H265 => &["-c:v", "libx265", "-preset", "medium"],
        VideoCodec::Vp9 => &["-c:v", "libvpx-vp9", "-deadline", "realtime", "-cpu-used", "8"],
        VideoCodec::Copy => &[],
    }
}

fn audio_tuning_arguments(codec: AudioCodec) -> &'static [&'static str] {
    match codec {
        AudioCodec::Mp3 => &["-ar", "44100", "-ac", "2"],
        AudioCodec::Aac | AudioCodec::Mp2 | AudioCodec::Opus => &["-ar", "48000", "-ac", "2"],
        AudioCodec::Copy => &[],
    }
}

fn resolve_bitrate(preset: Quality, custom: &str, table: &'static str) -> String {
    if preset == Quality::Custom && !custom.trim().is_empty() {
        custom.trim().to_string()
    } else {
        table.to_string()
    }
}

/// Build the profile for the configured mode, codecs and quality.
pub fn build_profile(config: &TranscodeConfig) -> TranscodingProfile {
    let mut extra_arguments = resilience_arguments();

    if config.mode == TranscodeMode::Copy {
        return TranscodingProfile {
            video_codec: VideoCodec::Copy,
            audio_codec: AudioCodec::Copy,
            video_bitrate: String::new(),
            audio_bitrate: String::new(),
            acceleration: HardwareKind::Cpu,
            container: CONTAINER_MPEGTS.to_string(),
            extra_arguments,
        };
    }

    let video_bitrate = if config.video_codec == VideoCodec::Copy {
        String::new()
    } else {
        resolve_bitrate(
            config.video_quality,
            &config.custom_video_bitrate,
            quality::video_bitrate(config.video_quality, config.video_codec),
        )
    };
    let audio_bitrate = if config.audio_codec == AudioCodec::Copy {
        String::new()
    } else {
        resolve_bitrate(
            config.audio_quality,
            &config.custom_audio_bitrate,
            quality::audio_bitrate(config.audio_quality, config.audio_codec),
        )
    };

    extra_arguments.extend(
        video_tuning_arguments(config.video_codec)
            .iter()
            .chain(audio_tuning_arguments(config.audio_codec))
            .map(|s| s.to_string()),
    );

    TranscodingProfile {
        video_codec: config.video_codec,
        audio_codec: config.audio_codec,
        video_bitrate,
        audio_bitrate,
        acceleration: HardwareKind::Cpu,
        container: CONTAINER_MPEGTS.to_string(),
        extra_arguments,
    }
}

/// Video and audio bitrates (kbps) derived from probed source properties
pub fn calculate_adaptive_bitrate(info: &StreamInfo) -> (u64, u64) {
    let pixels = u64::from(info.width) * u64::from(info.height);
    let mut video = RESOLUTION_TIERS
        .iter()
        .find(|(min_pixels, _)| pixels >= *min_pixels)
        .map(|(_, kbps)| *kbps)
        .unwrap_or(FALLBACK_VIDEO_KBPS);

    if info.fps > 30.0 {
        video = (video as f64 * info.fps / 30.0).round() as u64;
    }
    if info.video_bitrate_kbps > 0 && info.video_bitrate_kbps < video {
        video = info.video_bitrate_kbps;
    }

    let audio = if info.audio_bitrate_kbps > 0 {
        info.audio_bitrate_kbps.min(MAX_AUDIO_KBPS)
    } else {
        DEFAULT_AUDIO_KBPS
    };

    (video, audio)
}

/// Replace any `"adaptive"` bitrate with a value derived from `info`.
pub fn apply_adaptive(profile: &mut TranscodingProfile, info: &StreamInfo) {
    let (video, audio) = calculate_adaptive_bitrate(info);
    if profile.video_bitrate == ADAPTIVE {
        profile.video_bitrate = format!("{}k", video);
    }
    if profile.audio_bitrate == ADAPTIVE {
        profile.audio_bitrate = format!("{}k", audio);
    }
}

/// Bind the profile to the selected device.
///
/// For a GPU encode the software tuning flags are removed so they cannot
/// reach the hardware encoder.
pub fn apply_hardware(profile: &mut TranscodingProfile, device: &HardwareDevice) {
    profile.acceleration = device.kind;

    let hardware_encode = device.kind != HardwareKind::Cpu
        && !matches!(profile.video_codec, VideoCodec::Mpeg2 | VideoCodec::Copy);
    if !hardware_encode {
        return;
    }

    let mut kept = Vec::with_capacity(profile.extra_arguments.len());
    let mut args = profile.extra_arguments.iter().peekable();
    while let Some(arg) = args.next() {
        if SOFTWARE_TUNING_FLAGS.contains(&arg.as_str()) {
            // Drop the value as well
            if args.peek().is_some_and(|v| !v.starts_with('-')) {
                args.next();
            }
            continue;
        }
        kept.push(arg.clone());
    }
    profile.extra_arguments = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn transcode_config(video: VideoCodec, audio: AudioCodec, preset: Quality) -> TranscodeConfig {
        TranscodeConfig {
            mode: TranscodeMode::Transcode,
            video_codec: video,
            audio_codec: audio,
            video_quality: preset,
            audio_quality: preset,
            ..TranscodeConfig::default()
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_quality_low_h264() {
        let profile = build_profile(&transcode_config(
            VideoCodec::H264,
            AudioCodec::Aac,
            Quality::Low,
        ));
        assert_eq!(profile.video_bitrate, "2M");
        assert_eq!(profile.audio_bitrate, "128k");
        assert_eq!(profile.container, "mpegts");
    }

    #[test]
    fn test_quality_high_mpeg2() {
        let profile = build_profile(&transcode_config(
            VideoCodec::Mpeg2,
            AudioCodec::Mp2,
            Quality::High,
        ));
        assert_eq!(profile.video_bitrate, "10M");
        assert_eq!(profile.audio_bitrate, "320k");
        assert!(has_pair(&profile.extra_arguments, "-c:v", "mpeg2video"));
        assert!(has_pair(&profile.extra_arguments, "-g", "15"));
    }

    #[test]
    fn test_custom_literal_is_unchanged() {
        let mut config = transcode_config(VideoCodec::H264, AudioCodec::Aac, Quality::Custom);
        config.custom_video_bitrate = "3500k".to_string();
        config.custom_audio_bitrate = "160k".to_string();

        let profile = build_profile(&config);
        assert_eq!(profile.video_bitrate, "3500k");
        assert_eq!(profile.audio_bitrate, "160k");
    }

    #[test]
    fn test_copy_mode_forces_copy_codecs() {
        let mut config = transcode_config(VideoCodec::H265, AudioCodec::Mp3, Quality::High);
        config.mode = TranscodeMode::Copy;

        let profile = build_profile(&config);
        assert!(profile.is_copy());
        assert!(profile.video_bitrate.is_empty());
        assert!(profile.audio_bitrate.is_empty());
        assert!(has_pair(&profile.extra_arguments, "-f", "mpegts"));
        assert!(!profile.extra_arguments.iter().any(|a| a == "-preset"));
        assert!(has_pair(&profile.arguments(), "-c:v", "copy"));
        assert!(!profile.arguments().iter().any(|a| a == "-b:v"));
    }

    #[test]
    fn test_resilience_flags_always_attached() {
        let profile = build_profile(&transcode_config(
            VideoCodec::Vp9,
            AudioCodec::Opus,
            Quality::Medium,
        ));
        let args = &profile.extra_arguments;
        assert!(has_pair(args, "-fflags", "+genpts+discardcorrupt+nobuffer"));
        assert!(has_pair(args, "-reconnect_delay_max", "5"));
        assert!(has_pair(args, "-max_muxing_queue_size", "1024"));
        assert!(has_pair(args, "-deadline", "realtime"));
        assert!(has_pair(args, "-ar", "48000"));
    }

    #[test]
    fn test_mp3_uses_44k_sample_rate() {
        let profile = build_profile(&transcode_config(
            VideoCodec::H264,
            AudioCodec::Mp3,
            Quality::Medium,
        ));
        assert!(has_pair(&profile.extra_arguments, "-ar", "44100"));
        assert!(has_pair(&profile.arguments(), "-c:a", "libmp3lame"));
    }

    #[test]
    fn test_adaptive_tiers_and_caps() {
        let hd = StreamInfo {
            width: 1920,
            height: 1080,
            ..StreamInfo::default()
        };
        assert_eq!(calculate_adaptive_bitrate(&hd), (5000, 128));

        let uhd_60 = StreamInfo {
            width: 3840,
            height: 2160,
            fps: 60.0,
            ..StreamInfo::default()
        };
        assert_eq!(calculate_adaptive_bitrate(&uhd_60).0, 30000);

        let starved = StreamInfo {
            width: 1280,
            height: 720,
            video_bitrate_kbps: 1200,
            audio_bitrate_kbps: 448,
            ..StreamInfo::default()
        };
        assert_eq!(calculate_adaptive_bitrate(&starved), (1200, 320));

        assert_eq!(calculate_adaptive_bitrate(&StreamInfo::default()), (800, 128));
    }

    #[test]
    fn test_apply_adaptive_only_touches_sentinels() {
        let mut config = transcode_config(VideoCodec::H264, AudioCodec::Aac, Quality::Custom);
        config.custom_video_bitrate = ADAPTIVE.to_string();
        config.custom_audio_bitrate = "96k".to_string();
        let mut profile = build_profile(&config);
        assert!(profile.is_adaptive());
        assert!(!profile.arguments().iter().any(|a| a == "-b:v"));

        let info = StreamInfo {
            width: 1280,
            height: 720,
            ..StreamInfo::default()
        };
        apply_adaptive(&mut profile, &info);

        assert_eq!(profile.video_bitrate, "2500k");
        assert_eq!(profile.audio_bitrate, "96k");
        assert!(!profile.is_adaptive());
    }

    #[test]
    fn test_apply_hardware_strips_software_tuning() {
        let mut profile = build_profile(&transcode_config(
            VideoCodec::H264,
            AudioCodec::Aac,
            Quality::Medium,
        ));
        let gpu = HardwareDevice::new(HardwareKind::Nvidia, 0, "GPU-1", "RTX", ["h264", "h265"]);
        apply_hardware(&mut profile, &gpu);

        assert_eq!(profile.acceleration, HardwareKind::Nvidia);
        for flag in ["-preset", "-profile:v", "-level", "-pix_fmt", "-c:v"] {
            assert!(!profile.extra_arguments.iter().any(|a| a == flag), "{flag} kept");
        }
        assert!(!profile.extra_arguments.iter().any(|a| a == "libx264"));
        assert!(has_pair(&profile.extra_arguments, "-ar", "48000"));
        assert!(has_pair(&profile.extra_arguments, "-reconnect", "1"));
    }

    #[test]
    fn test_apply_hardware_keeps_cpu_tuning() {
        let mut profile = build_profile(&transcode_config(
            VideoCodec::H264,
            AudioCodec::Aac,
            Quality::Medium,
        ));
        let before = profile.extra_arguments.clone();
        apply_hardware(&mut profile, &HardwareDevice::cpu());
        assert_eq!(profile.extra_arguments, before);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_adaptive_video_never_exceeds_known_source(
            width in 0u32..8000,
            height in 0u32..5000,
            fps in 1.0f64..120.0,
            source in 1u64..50_000,
        ) {
            let info = StreamInfo {
                width,
                height,
                fps,
                video_bitrate_kbps: source,
                audio_bitrate_kbps: 0,
            };
            let (video, audio) = calculate_adaptive_bitrate(&info);
            prop_assert!(video <= source);
            prop_assert!(video > 0);
            prop_assert_eq!(audio, DEFAULT_AUDIO_KBPS);
        }
    }
}
