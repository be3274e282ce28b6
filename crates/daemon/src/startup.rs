//! Startup checks
//!
//! Verifies the external encoder tools are present before the daemon starts
//! accepting streams:
//! - ffmpeg must run and report a version
//! - ffprobe must run when transcoding (it backs adaptive bitrate)

use crate::config::{Config, TranscodeMode};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extract the major version from `<tool> -version` output.
///
/// Handles plain releases ("ffmpeg version 6.1.1") and git builds
/// prefixed with `n` ("ffmpeg version n7.0-12-gabc").
pub fn parse_tool_version(version_output: &str, tool: &str) -> Option<u32> {
    let marker = format!("{} version", tool.to_lowercase());
    let version_line = version_output
        .lines()
        .map(str::to_lowercase)
        .find(|line| line.contains(&marker))?;

    let version_part = version_line
        .split(&marker)
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Convenience wrapper for ffmpeg output
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    parse_tool_version(version_output, "ffmpeg")
}

/// Run `<program> -version` and report the parsed major version.
///
/// A tool that runs but prints an unrecognised banner is accepted with a
/// warning; custom builds do that.
pub async fn check_tool(program: &str, tool: &str) -> Result<Option<u32>, StartupError> {
    let unavailable = |reason: String| StartupError::ToolUnavailable {
        tool: tool.to_string(),
        reason,
    };

    let mut cmd = Command::new(program);
    cmd.arg("-version").stdin(Stdio::null()).kill_on_drop(true);

    let output = tokio::time::timeout(VERSION_CHECK_TIMEOUT, cmd.output())
        .await
        .map_err(|_| unavailable(format!("{} -version timed out", program)))?
        .map_err(|e| {
            unavailable(format!(
                "failed to run {} -version; is it installed and in PATH? {}",
                program, e
            ))
        })?;

    if !output.status.success() {
        return Err(unavailable(format!(
            "{} -version exited with {}",
            program, output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    match parse_tool_version(&version_output, tool) {
        Some(major) => {
            info!(tool, program, major, "Found encoder tool");
            Ok(Some(major))
        }
        None => {
            warn!(
                tool,
                program,
                banner = version_output.lines().next().unwrap_or("(empty)"),
                "Could not parse tool version"
            );
            Ok(None)
        }
    }
}

/// Run all startup checks in order
///
/// 1. ffmpeg availability
/// 2. ffprobe availability, skipped in copy mode
pub async fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_tool(&cfg.encoder.ffmpeg_path, "ffmpeg").await?;
    if cfg.transcode.mode != TranscodeMode::Copy {
        check_tool(&cfg.encoder.ffprobe_path, "ffprobe").await?;
    }
    Ok(())
}
