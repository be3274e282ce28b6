//! Codec/hardware compatibility rules

use crate::config::{HardwareKind, VideoCodec};
use crate::hardware::device::HardwareDevice;
use thiserror::Error;

/// Error type for compatibility checks
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompatibilityError {
    #[error("codec {codec} not supported on {device}")]
    CodecNotSupported { codec: VideoCodec, device: String },
}

/// Codecs the device can be asked to encode
pub fn supported_codecs(device: &HardwareDevice) -> Vec<VideoCodec> {
    match device.kind {
        HardwareKind::Nvidia | HardwareKind::Amd => vec![VideoCodec::H264, VideoCodec::H265],
        HardwareKind::Intel => {
            let mut codecs = vec![VideoCodec::H264, VideoCodec::H265];
            if device.supports("vp9") {
                codecs.push(VideoCodec::Vp9);
            }
            codecs
        }
        HardwareKind::Cpu => vec![
            VideoCodec::H264,
            VideoCodec::H265,
            VideoCodec::Vp9,
            VideoCodec::Mpeg2,
        ],
    }
}

/// Whether `device` can produce `codec`
///
/// Stream copy needs no encoder and always passes. MPEG-2 is software only.
pub fn can_encode(device: &HardwareDevice, codec: VideoCodec) -> bool {
    match codec {
        VideoCodec::Copy => true,
        VideoCodec::Mpeg2 => device.kind == HardwareKind::Cpu,
        _ if device.kind == HardwareKind::Cpu => true,
        _ => supported_codecs(device).contains(&codec) && device.supports(codec.as_str()),
    }
}

pub fn ensure_compatible(
    device: &HardwareDevice,
    codec: VideoCodec,
) -> Result<(), CompatibilityError> {
    if can_encode(device, codec) {
        Ok(())
    } else {
        Err(CompatibilityError::CodecNotSupported {
            codec,
            device: format!("{} ({})", device.id(), device.display_name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nvidia() -> HardwareDevice {
        HardwareDevice::new(HardwareKind::Nvidia, 0, "GPU-1", "NVIDIA GPU", ["h264", "h265"])
    }

    #[test]
    fn test_mpeg2_is_cpu_only() {
        assert!(can_encode(&HardwareDevice::cpu(), VideoCodec::Mpeg2));
        assert!(!can_encode(&nvidia(), VideoCodec::Mpeg2));

        let err = ensure_compatible(&nvidia(), VideoCodec::Mpeg2).unwrap_err();
        assert!(err.to_string().contains("mpeg2"));
        assert!(err.to_string().contains("nvidia:0"));
    }

    #[test]
    fn test_capabilities_limit_gpu_codecs() {
        let h264_only =
            HardwareDevice::new(HardwareKind::Amd, 0, "/dev/dri/renderD128", "AMD GPU", ["h264"]);
        assert!(can_encode(&h264_only, VideoCodec::H264));
        assert!(!can_encode(&h264_only, VideoCodec::H265));
        assert!(!can_encode(&nvidia(), VideoCodec::Vp9));
    }

    #[test]
    fn test_intel_vp9_requires_detection() {
        let plain = HardwareDevice::new(
            HardwareKind::Intel,
            0,
            "/dev/dri/renderD128",
            "Intel GPU",
            ["h264", "h265"],
        );
        let with_vp9 = HardwareDevice::new(
            HardwareKind::Intel,
            0,
            "/dev/dri/renderD128",
            "Intel GPU",
            ["h264", "h265", "vp9"],
        );

        assert!(!supported_codecs(&plain).contains(&VideoCodec::Vp9));
        assert!(supported_codecs(&with_vp9).contains(&VideoCodec::Vp9));
        assert!(can_encode(&with_vp9, VideoCodec::Vp9));
    }

    #[test]
    fn test_copy_is_always_compatible() {
        assert!(ensure_compatible(&nvidia(), VideoCodec::Copy).is_ok());
    }
}
