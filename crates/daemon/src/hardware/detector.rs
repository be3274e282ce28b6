//! Hardware discovery
//!
//! Probes the host for encoder backends using vendor tools:
//! - `nvidia-smi` for NVIDIA GPUs, confirmed with a one-second test encode
//! - `vainfo` on each `/dev/dri/renderD*` node for Intel and AMD
//! - an AMF test encode on Windows
//!
//! Every probe failure is non-fatal; the CPU entry is always present.

use crate::config::HardwareKind;
use crate::hardware::device::{HardwareCatalog, HardwareDevice};
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Error type for a single vendor probe
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("{tool} not available: {source}")]
    ToolUnavailable {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}")]
    ToolFailed { tool: String, status: std::process::ExitStatus },

    #[error("{tool} timed out")]
    Timeout { tool: String },

    #[error("no devices found")]
    NoDevices,
}

/// A GPU row from `nvidia-smi`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvidiaGpu {
    pub index: u32,
    pub name: String,
    pub uuid: String,
}

/// What `vainfo` reported for one render node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaapiNode {
    pub kind: HardwareKind,
    pub name: String,
    pub codecs: Vec<String>,
}

/// NVENC encoders tried per GPU and the codec each confirms
const NVENC_TESTS: &[(&str, &str)] = &[("h264_nvenc", "h264"), ("hevc_nvenc", "h265")];

/// Parse `nvidia-smi --query-gpu=index,name,uuid --format=csv,noheader`
///
/// Rows with fewer than three fields or a non-numeric index are skipped.
pub fn parse_nvidia_smi(output: &str) -> Vec<NvidiaGpu> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 3 {
                return None;
            }
            let index = fields[0].parse().ok()?;
            Some(NvidiaGpu {
                index,
                name: fields[1].to_string(),
                uuid: fields[2].to_string(),
            })
        })
        .collect()
}

/// Classify a render node from `vainfo` output and list its encodable codecs.
///
/// Returns `None` for unknown vendors and for nodes without any codec.
pub fn parse_vainfo(output: &str) -> Option<VaapiNode> {
    let is_intel = output.contains("Intel") || output.contains("i965") || output.contains("iHD");
    let (kind, name) = if is_intel {
        let name = if output.contains("iHD") {
            "Intel GPU (iHD driver)"
        } else if output.contains("i965") {
            "Intel GPU (i965 driver)"
        } else {
            "Intel GPU"
        };
        (HardwareKind::Intel, name)
    } else if output.contains("AMD") || output.contains("radeonsi") {
        let name = if output.contains("radeonsi") {
            "AMD GPU (RadeonSI)"
        } else {
            "AMD GPU"
        };
        (HardwareKind::Amd, name)
    } else {
        return None;
    };

    let codecs = vaapi_codecs(output);
    if codecs.is_empty() {
        return None;
    }

    Some(VaapiNode {
        kind,
        name: name.to_string(),
        codecs,
    })
}

/// Codecs with an encode entrypoint. Older `vainfo` builds list profiles
/// without entrypoints, in which case any mention counts.
fn vaapi_codecs(output: &str) -> Vec<String> {
    let has_entrypoints = output.contains("VAEntrypoint");
    let relevant: Vec<String> = output
        .lines()
        .filter(|line| !has_entrypoints || line.contains("VAEntrypointEnc"))
        .map(str::to_uppercase)
        .collect();
    let mentions = |needles: &[&str]| {
        relevant
            .iter()
            .any(|line| needles.iter().any(|n| line.contains(n)))
    };

    let mut codecs = Vec::new();
    if mentions(&["H264", "AVC"]) {
        codecs.push("h264".to_string());
    }
    if mentions(&["H265", "HEVC"]) {
        codecs.push("h265".to_string());
    }
    if mentions(&["VP8"]) {
        codecs.push("vp8".to_string());
    }
    if mentions(&["VP9"]) {
        codecs.push("vp9".to_string());
    }
    codecs
}

/// Hardware context for a synthetic test encode
#[derive(Debug, Clone, Copy)]
pub enum TestTarget<'a> {
    Nvidia { index: u32 },
    Vaapi { device_path: &'a str },
    Plain,
}

/// Arguments for a one-second synthetic encode with `encoder`
pub fn test_encode_args(encoder: &str, target: TestTarget<'_>) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    if let TestTarget::Vaapi { device_path } = target {
        args.extend(["-vaapi_device".to_string(), device_path.to_string()]);
    }
    args.extend(
        ["-f", "lavfi", "-i", "testsrc=duration=1:size=320x240:rate=1", "-c:v", encoder]
            .map(String::from),
    );
    if let TestTarget::Nvidia { index } = target {
        args.extend(["-gpu".to_string(), index.to_string()]);
    }
    args.extend(["-f", "null", "-"].map(String::from));
    args
}

/// Probes the host for encoder devices
#[derive(Debug, Clone)]
pub struct Detector {
    ffmpeg: String,
    nvidia_smi: String,
    vainfo: String,
    dri_dir: PathBuf,
    query_timeout: Duration,
    encode_timeout: Duration,
}

impl Default for Detector {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            nvidia_smi: "nvidia-smi".to_string(),
            vainfo: "vainfo".to_string(),
            dri_dir: PathBuf::from("/dev/dri"),
            query_timeout: Duration::from_secs(10),
            encode_timeout: Duration::from_secs(15),
        }
    }
}

impl Detector {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ..Self::default()
        }
    }

    pub fn with_nvidia_smi(mut self, program: impl Into<String>) -> Self {
        self.nvidia_smi = program.into();
        self
    }

    pub fn with_vainfo(mut self, program: impl Into<String>) -> Self {
        self.vainfo = program.into();
        self
    }

    pub fn with_dri_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dri_dir = dir.into();
        self
    }

    /// Build the device catalog. Never fails; at worst only CPU is listed.
    pub async fn discover(&self) -> HardwareCatalog {
        let mut devices = vec![HardwareDevice::cpu()];

        let (nvidia, vaapi) = tokio::join!(self.detect_nvidia(), self.detect_vaapi());
        match nvidia {
            Ok(found) => devices.extend(found),
            Err(e) => debug!(error = %e, "NVIDIA detection skipped"),
        }
        match vaapi {
            Ok(found) => devices.extend(found),
            Err(e) => debug!(error = %e, "VA-API detection skipped"),
        }

        if cfg!(windows) && !devices.iter().any(|d| d.kind == HardwareKind::Amd) {
            if self.test_encode("h264_amf", TestTarget::Plain).await {
                info!("Detected AMD GPU via AMF");
                devices.push(HardwareDevice::new(
                    HardwareKind::Amd,
                    0,
                    "",
                    "AMD GPU (AMF)",
                    ["h264", "h265"],
                ));
            }
        }

        HardwareCatalog::new(devices)
    }

    async fn detect_nvidia(&self) -> Result<Vec<HardwareDevice>, DetectError> {
        let output = self
            .run_tool(
                &self.nvidia_smi,
                &["--query-gpu=index,name,uuid", "--format=csv,noheader"],
                self.query_timeout,
            )
            .await?;

        let gpus = parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout));
        if gpus.is_empty() {
            return Err(DetectError::NoDevices);
        }

        let mut devices = Vec::new();
        for gpu in gpus {
            let mut codecs = Vec::new();
            for (encoder, codec) in NVENC_TESTS {
                if self
                    .test_encode(encoder, TestTarget::Nvidia { index: gpu.index })
                    .await
                {
                    codecs.push(*codec);
                }
            }

            if codecs.is_empty() {
                debug!(index = gpu.index, name = %gpu.name, "NVIDIA GPU failed all encode tests");
                continue;
            }

            info!(index = gpu.index, name = %gpu.name, codecs = ?codecs, "Detected NVIDIA GPU");
            devices.push(HardwareDevice::new(
                HardwareKind::Nvidia,
                gpu.index,
                &gpu.uuid,
                &format!("NVIDIA {}", gpu.name),
                codecs,
            ));
        }

        if devices.is_empty() {
            return Err(DetectError::NoDevices);
        }
        Ok(devices)
    }

    async fn detect_vaapi(&self) -> Result<Vec<HardwareDevice>, DetectError> {
        let nodes = self.render_nodes().await;
        if nodes.is_empty() {
            return Err(DetectError::NoDevices);
        }

        let mut devices = Vec::new();
        let mut next_intel = 0;
        let mut next_amd = 0;

        for node in nodes {
            let node = node.to_string_lossy().into_owned();
            let output = match self
                .run_tool(
                    &self.vainfo,
                    &["--display", "drm", "--device", &node],
                    self.query_timeout,
                )
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    debug!(node = %node, error = %e, "vainfo probe failed");
                    continue;
                }
            };

            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));

            let Some(found) = parse_vainfo(&combined) else {
                debug!(node = %node, "render node has no usable encoder");
                continue;
            };

            let index = match found.kind {
                HardwareKind::Intel => {
                    next_intel += 1;
                    next_intel - 1
                }
                _ => {
                    next_amd += 1;
                    next_amd - 1
                }
            };

            info!(
                node = %node,
                kind = %found.kind,
                codecs = ?found.codecs,
                "Detected VA-API device"
            );
            devices.push(HardwareDevice::new(found.kind, index, &node, &found.name, found.codecs));
        }

        if devices.is_empty() {
            return Err(DetectError::NoDevices);
        }
        Ok(devices)
    }

    async fn render_nodes(&self) -> Vec<PathBuf> {
        let mut nodes = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.dri_dir).await else {
            return nodes;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with("renderD") {
                nodes.push(entry.path());
            }
        }
        nodes.sort();
        nodes
    }

    /// Run a synthetic encode; true when the encoder exits successfully
    async fn test_encode(&self, encoder: &str, target: TestTarget<'_>) -> bool {
        let args = test_encode_args(encoder, target);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match self.run_tool(&self.ffmpeg, &args, self.encode_timeout).await {
            Ok(_) => true,
            Err(e) => {
                debug!(encoder, error = %e, "hardware encode test failed");
                false
            }
        }
    }

    async fn run_tool(
        &self,
        program: &str,
        args: &[&str],
        limit: Duration,
    ) -> Result<Output, DetectError> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| DetectError::Timeout {
                tool: program.to_string(),
            })?
            .map_err(|source| DetectError::ToolUnavailable {
                tool: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(DetectError::ToolFailed {
                tool: program.to_string(),
                status: output.status,
            });
        }
        Ok(output)
    }
}
