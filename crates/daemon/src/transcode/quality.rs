//! Quality preset to bitrate lookup

use crate::config::{AudioCodec, Quality, VideoCodec};

/// Video bitrate for a preset. `Custom` is resolved by the caller and falls
/// back to the medium rate here.
pub fn video_bitrate(quality: Quality, codec: VideoCodec) -> &'static str {
    let (low, medium, high) = match codec {
        VideoCodec::Mpeg2 => ("4M", "6M", "10M"),
        VideoCodec::Vp9 => ("1.5M", "3M", "6M"),
        VideoCodec::H264 | VideoCodec::H265 | VideoCodec::Copy => ("2M", "4M", "8M"),
    };
    pick(quality, low, medium, high)
}

/// Audio bitrate for a preset
pub fn audio_bitrate(quality: Quality, codec: AudioCodec) -> &'static str {
    let (low, medium, high) = match codec {
        AudioCodec::Mp2 => ("192k", "224k", "320k"),
        AudioCodec::Opus => ("96k", "128k", "192k"),
        AudioCodec::Aac | AudioCodec::Mp3 | AudioCodec::Copy => ("128k", "192k", "256k"),
    };
    pick(quality, low, medium, high)
}

fn pick(
    quality: Quality,
    low: &'static str,
    medium: &'static str,
    high: &'static str,
) -> &'static str {
    match quality {
        Quality::Low => low,
        Quality::High => high,
        Quality::Medium | Quality::Custom => medium,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_video_table() {
        assert_eq!(video_bitrate(Quality::Low, VideoCodec::H264), "2M");
        assert_eq!(video_bitrate(Quality::Medium, VideoCodec::H265), "4M");
        assert_eq!(video_bitrate(Quality::High, VideoCodec::Mpeg2), "10M");
        assert_eq!(video_bitrate(Quality::Low, VideoCodec::Mpeg2), "4M");
        assert_eq!(video_bitrate(Quality::High, VideoCodec::Vp9), "6M");
    }

    #[test]
    fn test_audio_table() {
        assert_eq!(audio_bitrate(Quality::Low, AudioCodec::Aac), "128k");
        assert_eq!(audio_bitrate(Quality::High, AudioCodec::Mp3), "256k");
        assert_eq!(audio_bitrate(Quality::Medium, AudioCodec::Mp2), "224k");
        assert_eq!(audio_bitrate(Quality::High, AudioCodec::Mp2), "320k");
        assert_eq!(audio_bitrate(Quality::Low, AudioCodec::Opus), "96k");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Higher presets never ask for less bandwidth.
        #[test]
        fn prop_presets_are_ordered(codec_idx in 0usize..4) {
            let codecs = [VideoCodec::H264, VideoCodec::H265, VideoCodec::Vp9, VideoCodec::Mpeg2];
            let rate = |q| -> f64 {
                video_bitrate(q, codecs[codec_idx]).trim_end_matches('M').parse().unwrap()
            };
            prop_assert!(rate(Quality::Low) < rate(Quality::Medium));
            prop_assert!(rate(Quality::Medium) < rate(Quality::High));
            prop_assert_eq!(rate(Quality::Custom), rate(Quality::Medium));
        }
    }
}
