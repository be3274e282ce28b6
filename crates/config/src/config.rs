//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is not acceptable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Implements `as_str`, `Display` and `FromStr` for a plain lowercase enum.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Lowercase name as used in config files and headers
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(ConfigError::Invalid(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Whether streams are re-encoded or passed through with stream copy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeMode {
    Copy,
    Transcode,
}

string_enum!(TranscodeMode { Copy => "copy", Transcode => "transcode" });

/// Output video codec
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Mpeg2,
    Copy,
}

string_enum!(VideoCodec {
    H264 => "h264",
    H265 => "h265",
    Vp9 => "vp9",
    Mpeg2 => "mpeg2",
    Copy => "copy",
});

/// Output audio codec
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Mp3,
    Mp2,
    Opus,
    Copy,
}

string_enum!(AudioCodec {
    Aac => "aac",
    Mp3 => "mp3",
    Mp2 => "mp2",
    Opus => "opus",
    Copy => "copy",
});

/// Quality preset; `Custom` takes its bitrate from the matching custom field
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
    Custom,
}

string_enum!(Quality {
    Low => "low",
    Medium => "medium",
    High => "high",
    Custom => "custom",
});

/// Category of hardware encoder backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HardwareKind {
    Cpu,
    Nvidia,
    Intel,
    Amd,
}

string_enum!(HardwareKind {
    Cpu => "cpu",
    Nvidia => "nvidia",
    Intel => "intel",
    Amd => "amd",
});

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

string_enum!(LogFormat { Compact => "compact", Json => "json" });

/// Parsed form of the `hardware.device` selector string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareSpec {
    /// Pick the best available device
    Auto,
    /// Force software encoding
    Disabled,
    /// Any available device of this kind
    Kind(HardwareKind),
    /// Exactly this device
    Device(HardwareKind, u32),
}

impl HardwareSpec {
    /// Parse `auto`, `none`, `kind` or `kind:index`
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        match s.to_lowercase().as_str() {
            "" | "auto" => return Ok(HardwareSpec::Auto),
            "none" => return Ok(HardwareSpec::Disabled),
            _ => {}
        }

        match s.split_once(':') {
            None => Ok(HardwareSpec::Kind(s.parse()?)),
            Some((kind, index)) => {
                let kind: HardwareKind = kind.parse()?;
                let index = index.trim().parse::<u32>().map_err(|_| {
                    ConfigError::Invalid(format!("invalid device index in '{}'", s))
                })?;
                Ok(HardwareSpec::Device(kind, index))
            }
        }
    }
}

impl fmt::Display for HardwareSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareSpec::Auto => f.write_str("auto"),
            HardwareSpec::Disabled => f.write_str("none"),
            HardwareSpec::Kind(kind) => write!(f, "{}", kind),
            HardwareSpec::Device(kind, index) => write!(f, "{}:{}", kind, index),
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error (default info)
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Codec and quality selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeConfig {
    #[serde(default = "default_mode")]
    pub mode: TranscodeMode,
    #[serde(default = "default_video_codec")]
    pub video_codec: VideoCodec,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: AudioCodec,
    #[serde(default = "default_quality")]
    pub video_quality: Quality,
    #[serde(default = "default_quality")]
    pub audio_quality: Quality,
    /// Literal bitrate (e.g. "3500k") or "adaptive" when video_quality is custom
    #[serde(default)]
    pub custom_video_bitrate: String,
    /// Literal bitrate or "adaptive" when audio_quality is custom
    #[serde(default)]
    pub custom_audio_bitrate: String,
}

fn default_mode() -> TranscodeMode {
    TranscodeMode::Transcode
}

fn default_video_codec() -> VideoCodec {
    VideoCodec::H264
}

fn default_audio_codec() -> AudioCodec {
    AudioCodec::Aac
}

fn default_quality() -> Quality {
    Quality::Medium
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            video_quality: default_quality(),
            audio_quality: default_quality(),
            custom_video_bitrate: String::new(),
            custom_audio_bitrate: String::new(),
        }
    }
}

/// Hardware acceleration preference
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HardwareConfig {
    /// auto, none, kind or kind:index
    #[serde(default = "default_hardware_device")]
    pub device: String,
}

fn default_hardware_device() -> String {
    "auto".to_string()
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            device: default_hardware_device(),
        }
    }
}

/// Per-session buffering and retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BufferSettings {
    /// Ring buffer capacity in MiB (minimum 1)
    #[serde(default = "default_buffer_size_mb")]
    pub size_mb: u32,
    /// Fill level above which prefetching pauses (0.0-1.0)
    #[serde(default = "default_prefetch_ratio")]
    pub prefetch_ratio: f64,
    /// Bytes that must be buffered before a client read proceeds, in KiB
    #[serde(default = "default_min_threshold_kb")]
    pub min_threshold_kb: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// How long a client read waits for the threshold before giving up
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

fn default_buffer_size_mb() -> u32 {
    10
}

fn default_prefetch_ratio() -> f64 {
    0.8
}

fn default_min_threshold_kb() -> u32 {
    64
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_wait_timeout_secs() -> u64 {
    30
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            size_mb: default_buffer_size_mb(),
            prefetch_ratio: default_prefetch_ratio(),
            min_threshold_kb: default_min_threshold_kb(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

/// External tool locations and timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Time the encoder gets to exit on its own after stdin closes
    #[serde(default = "default_close_grace_secs")]
    pub close_grace_secs: u64,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_close_grace_secs() -> u64 {
    5
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            probe_timeout_secs: default_probe_timeout_secs(),
            close_grace_secs: default_close_grace_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub buffer: BufferSettings,
    #[serde(default)]
    pub encoder: EncoderConfig,
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Sets `$target` from env var `$var` when the value parses.
macro_rules! env_override {
    ($var:literal, $target:expr) => {
        if let Ok(val) = env::var($var) {
            if let Ok(parsed) = val.trim().parse() {
                $target = parsed;
            }
        }
    };
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Values that fail to parse are ignored and the existing setting is kept.
    pub fn apply_env_overrides(&mut self) {
        env_override!("BIND_ADDR", self.server.bind_addr);
        env_override!("PORT", self.server.port);
        env_override!("LOG_LEVEL", self.logging.level);
        env_override!("LOG_FORMAT", self.logging.format);
        env_override!("TRANSCODE_MODE", self.transcode.mode);
        env_override!("VIDEO_CODEC", self.transcode.video_codec);
        env_override!("AUDIO_CODEC", self.transcode.audio_codec);
        env_override!("VIDEO_QUALITY", self.transcode.video_quality);
        env_override!("AUDIO_QUALITY", self.transcode.audio_quality);
        env_override!("CUSTOM_VIDEO_BITRATE", self.transcode.custom_video_bitrate);
        env_override!("CUSTOM_AUDIO_BITRATE", self.transcode.custom_audio_bitrate);
        env_override!("HARDWARE_DEVICE", self.hardware.device);
        env_override!("BUFFER_SIZE_MB", self.buffer.size_mb);
        env_override!("BUFFER_PREFETCH_RATIO", self.buffer.prefetch_ratio);
        env_override!("BUFFER_MAX_RETRIES", self.buffer.max_retries);
        env_override!("BUFFER_RETRY_DELAY_MS", self.buffer.retry_delay_ms);
        env_override!("FFMPEG_PATH", self.encoder.ffmpeg_path);
        env_override!("FFPROBE_PATH", self.encoder.ffprobe_path);
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Config::default()
            }
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parsed hardware selector
    pub fn hardware_spec(&self) -> Result<HardwareSpec, ConfigError> {
        HardwareSpec::parse(&self.hardware.device)
    }

    /// Check value ranges and cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("port must be between 1 and 65535".into()));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log level '{}' (must be one of {})",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }

        let spec = self.hardware_spec()?;

        if self.buffer.size_mb < 1 {
            return Err(ConfigError::Invalid("buffer size must be at least 1MB".into()));
        }

        if !(0.0..=1.0).contains(&self.buffer.prefetch_ratio) {
            return Err(ConfigError::Invalid(
                "buffer prefetch ratio must be between 0.0 and 1.0".into(),
            ));
        }

        if self.buffer.min_threshold_kb as u64 * 1024 >= self.buffer.size_mb as u64 * 1024 * 1024
        {
            return Err(ConfigError::Invalid(
                "buffer min threshold must be smaller than the buffer".into(),
            ));
        }

        if self.transcode.mode == TranscodeMode::Copy {
            return Ok(());
        }

        let t = &self.transcode;
        if t.video_quality == Quality::Custom
            && t.video_codec != VideoCodec::Copy
            && t.custom_video_bitrate.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "custom video bitrate required when video quality is 'custom'".into(),
            ));
        }
        if t.audio_quality == Quality::Custom
            && t.audio_codec != AudioCodec::Copy
            && t.custom_audio_bitrate.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "custom audio bitrate required when audio quality is 'custom'".into(),
            ));
        }

        // mpeg2 has no hardware encoder on any supported vendor
        if t.video_codec == VideoCodec::Mpeg2 {
            let gpu = match spec {
                HardwareSpec::Kind(kind) | HardwareSpec::Device(kind, _) => {
                    (kind != HardwareKind::Cpu).then_some(kind)
                }
                _ => None,
            };
            if let Some(kind) = gpu {
                return Err(ConfigError::Invalid(format!(
                    "codec mpeg2 is not compatible with {} hardware acceleration",
                    kind
                )));
            }
        }

        Ok(())
    }
}
