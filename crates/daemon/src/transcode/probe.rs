//! Source inspection with ffprobe
//!
//! Only used when a bitrate is set to "adaptive". The probe output is
//! untrusted: missing or malformed fields fall back to defaults.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Frame rate assumed when the source does not report one
pub const DEFAULT_FPS: f64 = 30.0;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not be run or exited with an error.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),
}

/// Properties of the source stream relevant to bitrate selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// 0 when unknown
    pub video_bitrate_kbps: u64,
    /// 0 when unknown
    pub audio_bitrate_kbps: u64,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            fps: DEFAULT_FPS,
            video_bitrate_kbps: 0,
            audio_bitrate_kbps: 0,
        }
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub bit_rate: Option<String>,
    }
}

/// Run ffprobe against `url` and parse its report.
pub async fn probe_stream(
    ffprobe: &str,
    url: &str,
    limit: Duration,
) -> Result<StreamInfo, ProbeError> {
    let mut cmd = Command::new(ffprobe);
    cmd.args([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_streams",
        "-show_format",
        url,
    ])
    .stdin(Stdio::null())
    .kill_on_drop(true);

    let output = tokio::time::timeout(limit, cmd.output())
        .await
        .map_err(|_| ProbeError::Timeout(limit))?
        .map_err(|e| ProbeError::FfprobeFailed(e.to_string()))?;

    if !output.status.success() {
        return Err(ProbeError::FfprobeFailed(format!(
            "exit status {}",
            output.status
        )));
    }

    parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse ffprobe JSON output into [`StreamInfo`].
///
/// When the video stream carries no bitrate, the container bitrate is split
/// 90/10 between video and audio.
pub fn parse_ffprobe_output(json: &str) -> Result<StreamInfo, ProbeError> {
    let output: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let mut info = StreamInfo::default();

    for stream in output.streams.unwrap_or_default() {
        match stream.codec_type.as_deref() {
            Some("video") if info.width == 0 => {
                info.width = stream.width.unwrap_or(0);
                info.height = stream.height.unwrap_or(0);
                info.video_bitrate_kbps = parse_kbps(stream.bit_rate.as_deref());
                if let Some(fps) = stream.avg_frame_rate.as_deref().and_then(parse_frame_rate) {
                    info.fps = fps;
                }
            }
            Some("audio") if info.audio_bitrate_kbps == 0 => {
                info.audio_bitrate_kbps = parse_kbps(stream.bit_rate.as_deref());
            }
            _ => {}
        }
    }

    if info.video_bitrate_kbps == 0 {
        let total = parse_kbps(output.format.and_then(|f| f.bit_rate).as_deref());
        if total > 0 {
            info.video_bitrate_kbps = total * 9 / 10;
            if info.audio_bitrate_kbps == 0 {
                info.audio_bitrate_kbps = total / 10;
            }
        }
    }

    Ok(info)
}

fn parse_kbps(bits_per_second: Option<&str>) -> u64 {
    bits_per_second
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|bps| bps / 1000)
        .unwrap_or(0)
}

/// Parse "num/den" as reported in `avg_frame_rate`
fn parse_frame_rate(s: &str) -> Option<f64> {
    let (num, den) = s.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}
