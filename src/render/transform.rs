// SPDX-License-Identifier: MPL-2.0

//! Quad transform for each scale mode.
//!
//! The quad spans clip space `[-1, 1]`; the vertex shader computes
//! `pos * xy + zw`. Scales below 1 letterbox, above 1 crop.

use cosmic_bg_video_config::ScaleMode;

pub type Transform = [f32; 4];

pub const IDENTITY: Transform = [1.0, 1.0, 0.0, 0.0];

pub fn scale_transform(
    mode: ScaleMode,
    video: (u32, u32),
    output: (u32, u32),
) -> Transform {
    if video.0 == 0 || video.1 == 0 || output.0 == 0 || output.1 == 0 {
        return IDENTITY;
    }

    let video_aspect = video.0 as f32 / video.1 as f32;
    let output_aspect = output.0 as f32 / output.1 as f32;
    let wider = video_aspect > output_aspect;

    let (x, y) = match mode {
        ScaleMode::Stretch => (1.0, 1.0),
        ScaleMode::Fit if wider => (1.0, output_aspect / video_aspect),
        ScaleMode::Fit => (video_aspect / output_aspect, 1.0),
        ScaleMode::Fill if wider => (video_aspect / output_aspect, 1.0),
        ScaleMode::Fill => (1.0, output_aspect / video_aspect),
    };

    [x, y, 0.0, 0.0]
}
