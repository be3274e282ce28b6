//! Per-request device selection and encoder argument generation

use crate::config::{HardwareKind, HardwareSpec, VideoCodec};
use crate::hardware::device::{HardwareCatalog, HardwareDevice};
use crate::transcode::profile::{self, TranscodingProfile};
use thiserror::Error;
use tracing::{debug, warn};

/// Auto-selection order
pub const PRIORITY: [HardwareKind; 4] = [
    HardwareKind::Nvidia,
    HardwareKind::Intel,
    HardwareKind::Amd,
    HardwareKind::Cpu,
];

/// Error type for hardware selection
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no hardware available")]
    NoHardware,

    #[error("hardware device {kind}:{index} not found")]
    DeviceNotFound { kind: HardwareKind, index: u32 },

    #[error("no suitable {0} hardware available")]
    NoSuitableHardware(HardwareKind),
}

/// Picks one device per request from a shared catalog
#[derive(Debug, Clone)]
pub struct HardwareSelector {
    catalog: HardwareCatalog,
    preferred: Option<HardwareKind>,
}

impl HardwareSelector {
    /// `preferred` is the configured device policy; only its kind is used as
    /// a preference when a request asks for `auto`.
    pub fn new(catalog: HardwareCatalog, preferred: HardwareSpec) -> Self {
        let preferred = match preferred {
            HardwareSpec::Kind(kind) | HardwareSpec::Device(kind, _) => Some(kind),
            HardwareSpec::Auto | HardwareSpec::Disabled => None,
        };
        Self { catalog, preferred }
    }

    pub fn catalog(&self) -> &HardwareCatalog {
        &self.catalog
    }

    /// Choose a device for `request`.
    pub fn select(&self, request: &HardwareSpec) -> Result<HardwareDevice, SelectionError> {
        match *request {
            HardwareSpec::Device(kind, index) => self
                .catalog
                .find(kind, index)
                .filter(|d| d.available)
                .cloned()
                .ok_or(SelectionError::DeviceNotFound { kind, index }),
            HardwareSpec::Kind(kind) => self
                .catalog
                .first_available(kind)
                .cloned()
                .ok_or(SelectionError::NoSuitableHardware(kind)),
            HardwareSpec::Disabled => Ok(self
                .catalog
                .first_available(HardwareKind::Cpu)
                .cloned()
                .unwrap_or_else(HardwareDevice::cpu)),
            HardwareSpec::Auto => self.select_auto(),
        }
    }

    fn select_auto(&self) -> Result<HardwareDevice, SelectionError> {
        if let Some(kind) = self.preferred {
            if let Some(device) = self.catalog.first_available(kind) {
                return Ok(device.clone());
            }
            warn!(
                preferred = %kind,
                "Preferred hardware not available, falling back to priority order"
            );
        }

        let device = PRIORITY
            .iter()
            .find_map(|kind| self.catalog.first_available(*kind))
            .cloned()
            .ok_or(SelectionError::NoHardware)?;
        debug!(device = %device.id(), name = %device.display_name, "Auto-selected hardware");
        Ok(device)
    }

    /// Encoder arguments for `device` producing `profile`.
    ///
    /// Callers must have checked codec compatibility already; MPEG-2 always
    /// gets the software path here.
    pub fn build_arguments(
        &self,
        device: &HardwareDevice,
        profile: &TranscodingProfile,
    ) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        if profile.video_codec == VideoCodec::Copy {
            push(&mut args, &["-c:v", "copy"]);
        } else if profile.video_codec == VideoCodec::Mpeg2 || device.kind == HardwareKind::Cpu {
            push(&mut args, &["-c:v", profile::software_video_encoder(profile.video_codec)]);
        } else {
            match device.kind {
                HardwareKind::Nvidia => {
                    self.nvidia_arguments(&mut args, device, profile.video_codec)
                }
                HardwareKind::Intel | HardwareKind::Amd
                    if device.device_path.starts_with("/dev/") =>
                {
                    vaapi_arguments(&mut args, device, profile.video_codec)
                }
                HardwareKind::Amd => amf_arguments(&mut args, profile.video_codec),
                HardwareKind::Intel | HardwareKind::Cpu => {
                    push(&mut args, &["-c:v", profile::software_video_encoder(profile.video_codec)])
                }
            }
        }

        if let Some(rate) = profile::effective_bitrate(
            &profile.video_bitrate,
            profile.video_codec == VideoCodec::Copy,
        ) {
            push(&mut args, &["-b:v", rate]);
        }

        push(&mut args, &["-c:a", profile::audio_encoder(profile.audio_codec)]);
        if let Some(rate) = profile::effective_bitrate(
            &profile.audio_bitrate,
            profile.audio_codec == crate::config::AudioCodec::Copy,
        ) {
            push(&mut args, &["-b:a", rate]);
        }

        args
    }

    fn nvidia_arguments(&self, args: &mut Vec<String>, device: &HardwareDevice, codec: VideoCodec) {
        if self.catalog.count_of(HardwareKind::Nvidia) > 1 {
            args.push("-gpu".to_string());
            args.push(device.device_index.to_string());
        }
        match codec {
            VideoCodec::H265 => push(
                args,
                &["-c:v", "hevc_nvenc", "-preset", "p4", "-tune", "hq", "-rc", "vbr"],
            ),
            _ => push(
                args,
                &[
                    "-c:v",
                    "h264_nvenc",
                    "-preset",
                    "p4",
                    "-tune",
                    "hq",
                    "-rc",
                    "vbr",
                    "-rc-lookahead",
                    "20",
                    "-b_ref_mode",
                    "middle",
                ],
            ),
        }
    }
}

fn push(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

fn vaapi_arguments(args: &mut Vec<String>, device: &HardwareDevice, codec: VideoCodec) {
    let encoder = match codec {
        VideoCodec::H265 => "hevc_vaapi",
        VideoCodec::Vp9 => "vp9_vaapi",
        _ => "h264_vaapi",
    };
    args.push("-init_hw_device".to_string());
    args.push(format!("vaapi=va:{}", device.device_path));
    push(
        args,
        &["-filter_hw_device", "va", "-vf", "format=nv12,hwupload", "-c:v", encoder],
    );
}

fn amf_arguments(args: &mut Vec<String>, codec: VideoCodec) {
    let encoder = match codec {
        VideoCodec::H265 => "hevc_amf",
        _ => "h264_amf",
    };
    push(
        args,
        &["-c:v", encoder, "-usage", "transcoding", "-quality", "balanced"],
    );
}
