// SPDX-License-Identifier: MPL-2.0

//! Stream probing and classification: codec, bit depth, color and cadence.

use std::path::Path;
use std::time::Duration;

use gstreamer_pbutils::prelude::*;
use gstreamer_video::{VideoColorMatrix, VideoColorRange, VideoColorimetry};
use tracing::info;

use super::DecodeError;
use crate::frame::{ColorMatrix, ColorRange};

/// Shortest frame duration accepted (240 fps).
pub const MIN_FRAME_DURATION: Duration = Duration::from_nanos(1_000_000_000 / 240);
/// Longest frame duration accepted (1 fps).
pub const MAX_FRAME_DURATION: Duration = Duration::from_secs(1);
/// Used when the container declares no rate.
pub const DEFAULT_FPS: u32 = 30;

const DISCOVER_TIMEOUT_SECS: u64 = 5;

/// What playback needs to know about the video stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub frame_duration: Duration,
    pub codec: String,
    pub bit_depth: u32,
    pub matrix: ColorMatrix,
    pub range: ColorRange,
    /// Compressed caps, used to find decoders.
    pub caps: gstreamer::Caps,
}

/// Discover the first video stream of a local file.
pub fn probe(path: &Path) -> Result<StreamInfo, DecodeError> {
    let discoverer = gstreamer_pbutils::Discoverer::new(gstreamer::ClockTime::from_seconds(
        DISCOVER_TIMEOUT_SECS,
    ))?;
    let uri = gstreamer::glib::filename_to_uri(path, None)?;
    let discovered = discoverer
        .discover_uri(&uri)
        .map_err(|source| DecodeError::Discover {
            path: path.to_owned(),
            source,
        })?;

    let video = discovered
        .video_streams()
        .into_iter()
        .next()
        .ok_or_else(|| DecodeError::NoVideoStream(path.to_owned()))?;
    let caps = video
        .caps()
        .ok_or_else(|| DecodeError::NoVideoStream(path.to_owned()))?;
    let structure = caps
        .structure(0)
        .ok_or_else(|| DecodeError::NoVideoStream(path.to_owned()))?;

    let width = video.width();
    let height = video.height();
    if width == 0 || height == 0 {
        return Err(DecodeError::NoVideoStream(path.to_owned()));
    }

    let codec = codec_name(structure);
    let bit_depth = classify_bit_depth(
        structure.get::<u32>("bit-depth-luma").ok(),
        structure.get::<&str>("format").ok(),
        &codec,
        structure.get::<&str>("profile").ok(),
    );
    let (matrix, range) = classify_color(structure.get::<&str>("colorimetry").ok(), width);
    let rate = video.framerate();
    let frame_duration = frame_duration(rate.numer(), rate.denom());
    let fps = 1.0 / frame_duration.as_secs_f64();

    info!(
        width,
        height,
        %codec,
        bit_depth,
        ?matrix,
        ?range,
        fps,
        "Video stream"
    );

    Ok(StreamInfo {
        width,
        height,
        frame_duration,
        codec,
        bit_depth,
        matrix,
        range,
        caps,
    })
}

/// Short codec name for a compressed caps structure.
pub fn codec_name(structure: &gstreamer::StructureRef) -> String {
    let name = structure.name().as_str();
    match name {
        "video/x-h264" => "h264".into(),
        "video/x-h265" => "hevc".into(),
        "video/x-vp8" => "vp8".into(),
        "video/x-vp9" => "vp9".into(),
        "video/x-av1" => "av1".into(),
        "video/mpeg" => match structure.get::<i32>("mpegversion") {
            Ok(1) => "mpeg1".into(),
            Ok(4) => "mpeg4".into(),
            _ => "mpeg2".into(),
        },
        "video/x-wmv" => match structure.get::<&str>("format") {
            Ok("WVC1") => "vc1".into(),
            _ => "wmv3".into(),
        },
        other => other.trim_start_matches("video/x-").to_owned(),
    }
}

/// Luma bit depth: explicit metadata, then the raw format name, then the
/// codec profile, then 8.
pub fn classify_bit_depth(
    bit_depth_luma: Option<u32>,
    raw_format: Option<&str>,
    codec: &str,
    profile: Option<&str>,
) -> u32 {
    if let Some(depth) = bit_depth_luma.filter(|depth| *depth > 0) {
        return depth;
    }

    if let Some(format) = raw_format {
        return depth_from_name(format).unwrap_or(8);
    }

    match (codec, profile) {
        ("vp9", Some(profile)) => match profile.parse::<u32>() {
            Ok(2..) => 10,
            _ => 8,
        },
        (_, Some(profile)) => depth_from_name(profile).unwrap_or(8),
        _ => 8,
    }
}

fn depth_from_name(name: &str) -> Option<u32> {
    if name.contains("12") {
        Some(12)
    } else if name.contains("10") {
        Some(10)
    } else {
        None
    }
}

/// Matrix and range from a colorimetry string, guessing what it leaves out.
pub fn classify_color(colorimetry: Option<&str>, width: u32) -> (ColorMatrix, ColorRange) {
    let parsed = colorimetry.and_then(|value| value.parse::<VideoColorimetry>().ok());

    let matrix = match parsed.as_ref().map(VideoColorimetry::matrix) {
        Some(VideoColorMatrix::Bt709) => ColorMatrix::Bt709,
        Some(VideoColorMatrix::Bt2020) => ColorMatrix::Bt2020,
        Some(VideoColorMatrix::Bt601 | VideoColorMatrix::Smpte240m | VideoColorMatrix::Fcc) => {
            ColorMatrix::Bt601
        }
        _ => ColorMatrix::guess_for_width(width),
    };

    let range = match parsed.as_ref().map(VideoColorimetry::range) {
        Some(VideoColorRange::Range0_255) => ColorRange::Full,
        _ => ColorRange::Limited,
    };

    (matrix, range)
}

/// Frame duration for a declared rate, clamped to the supported cadence.
pub fn frame_duration(numer: i32, denom: i32) -> Duration {
    let (numer, denom) = if numer > 0 && denom > 0 {
        (numer as u64, denom as u64)
    } else {
        (u64::from(DEFAULT_FPS), 1)
    };

    Duration::from_nanos(denom * 1_000_000_000 / numer).clamp(MIN_FRAME_DURATION, MAX_FRAME_DURATION)
}
