// SPDX-License-Identifier: MPL-2.0

//! Unit tests for stream classification and surface export helpers.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::decoder::{locate_plane, Export, MemorySpan};
    use super::super::stream::{
        classify_bit_depth, classify_color, codec_name, frame_duration, MAX_FRAME_DURATION,
        MIN_FRAME_DURATION,
    };
    use crate::frame::{ColorMatrix, ColorRange};

    fn structure(name: &str) -> gstreamer::Structure {
        gstreamer::init().unwrap();
        gstreamer::Structure::new_empty(name)
    }

    #[test]
    fn test_codec_names() {
        assert_eq!(codec_name(&structure("video/x-h264")), "h264");
        assert_eq!(codec_name(&structure("video/x-h265")), "hevc");
        assert_eq!(codec_name(&structure("video/x-vp9")), "vp9");
        assert_eq!(codec_name(&structure("video/x-av1")), "av1");
        assert_eq!(codec_name(&structure("video/x-theora")), "theora");

        gstreamer::init().unwrap();
        let mpeg2 = gstreamer::Structure::builder("video/mpeg")
            .field("mpegversion", 2i32)
            .build();
        assert_eq!(codec_name(&mpeg2), "mpeg2");

        let vc1 = gstreamer::Structure::builder("video/x-wmv")
            .field("format", "WVC1")
            .build();
        assert_eq!(codec_name(&vc1), "vc1");
    }

    #[test]
    fn test_bit_depth_prefers_metadata() {
        assert_eq!(classify_bit_depth(Some(10), None, "h264", None), 10);
        assert_eq!(classify_bit_depth(Some(8), None, "hevc", Some("main-10")), 8);
    }

    #[test]
    fn test_bit_depth_from_raw_format() {
        assert_eq!(classify_bit_depth(None, Some("I420_10LE"), "hevc", None), 10);
        assert_eq!(classify_bit_depth(None, Some("NV12"), "hevc", Some("main-10")), 8);
    }

    #[test]
    fn test_bit_depth_from_profile() {
        assert_eq!(classify_bit_depth(None, None, "hevc", Some("main-10")), 10);
        assert_eq!(classify_bit_depth(None, None, "hevc", Some("main")), 8);
        assert_eq!(classify_bit_depth(None, None, "h264", Some("high-10")), 10);
        assert_eq!(classify_bit_depth(None, None, "vp9", Some("2")), 10);
        assert_eq!(classify_bit_depth(None, None, "vp9", Some("0")), 8);
        assert_eq!(classify_bit_depth(None, None, "av1", None), 8);
        assert_eq!(classify_bit_depth(Some(0), None, "av1", None), 8);
    }

    #[test]
    fn test_color_from_colorimetry() {
        assert_eq!(
            classify_color(Some("bt709"), 640),
            (ColorMatrix::Bt709, ColorRange::Limited)
        );
        assert_eq!(
            classify_color(Some("bt2020"), 3840),
            (ColorMatrix::Bt2020, ColorRange::Limited)
        );
        assert_eq!(
            classify_color(Some("1:4:0:0"), 1920),
            (ColorMatrix::Bt601, ColorRange::Full)
        );
    }

    #[test]
    fn test_color_guessed_when_missing() {
        assert_eq!(classify_color(None, 1920), (ColorMatrix::Bt709, ColorRange::Limited));
        assert_eq!(classify_color(None, 720), (ColorMatrix::Bt601, ColorRange::Limited));
        assert_eq!(
            classify_color(Some("not-a-colorimetry"), 1280),
            (ColorMatrix::Bt709, ColorRange::Limited)
        );
    }

    #[test]
    fn test_frame_duration_clamped() {
        assert_eq!(frame_duration(30, 1), Duration::from_nanos(33_333_333));
        assert_eq!(frame_duration(30000, 1001), Duration::from_nanos(33_366_666));
        assert_eq!(frame_duration(1000, 1), MIN_FRAME_DURATION);
        assert_eq!(frame_duration(1, 5), MAX_FRAME_DURATION);
    }

    #[test]
    fn test_frame_duration_defaults_to_30fps() {
        assert_eq!(frame_duration(0, 1), frame_duration(30, 1));
        assert_eq!(frame_duration(25, 0), frame_duration(30, 1));
    }

    #[test]
    fn test_planes_in_single_memory() {
        let spans = [MemorySpan {
            start: 0,
            size: 1920 * 1080 * 3 / 2,
            offset: 0,
        }];
        assert_eq!(locate_plane(&spans, 0), Some((0, 0)));
        assert_eq!(locate_plane(&spans, 1920 * 1080), Some((0, 1920 * 1080)));
        assert_eq!(locate_plane(&spans, 1920 * 1080 * 2), None);
    }

    #[test]
    fn test_planes_across_memories() {
        let spans = [
            MemorySpan {
                start: 0,
                size: 4096,
                offset: 0,
            },
            MemorySpan {
                start: 4096,
                size: 2048,
                offset: 512,
            },
        ];
        assert_eq!(locate_plane(&spans, 4096), Some((1, 512)));
        assert_eq!(locate_plane(&spans, 5000), Some((1, 512 + 904)));
    }

    #[test]
    fn test_export_failure_is_final() {
        let mut export = Export::Untested;
        assert!(export.allows_attempt());

        assert!(export.settle(false));
        assert_eq!(export, Export::Failed);
        assert!(!export.allows_attempt());

        // neither a second failure nor a later success reopens it
        assert!(!export.settle(false));
        assert!(!export.settle(true));
        assert_eq!(export, Export::Failed);
    }

    #[test]
    fn test_export_success_can_still_fail() {
        let mut export = Export::Untested;
        assert!(export.settle(true));
        assert!(!export.settle(true));
        assert!(export.allows_attempt());

        assert!(export.settle(false));
        assert!(!export.allows_attempt());
    }
}
