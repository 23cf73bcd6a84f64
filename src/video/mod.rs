// SPDX-License-Identifier: MPL-2.0

//! Video decoding with GStreamer, preferring hardware decode and zero-copy
//! export of the decoded surfaces.
//!
//! # Module Structure
//!
//! - [`probe`]: accelerator discovery and selection
//! - [`stream`]: stream probing, codec/bit-depth/color classification
//! - [`decoder`]: the decode pipeline, surface export and CPU copies
//!
//! # Decode Paths
//!
//! | Decoder  | Output memory       | Frame payload                  |
//! |----------|---------------------|--------------------------------|
//! | hardware | DMA-BUF             | GPU surface (+ CPU copy if linear and requested) |
//! | hardware | system (after import failure) | ring slot            |
//! | software | system              | ring slot                      |
//!
//! NVIDIA decoders are only picked when nothing else can decode the stream,
//! or when `LIBVA_DRIVER_NAME=nvidia` asks for them, and only for streams in
//! the configured allow-list.

pub mod decoder;
pub mod probe;
pub mod stream;

use std::path::PathBuf;

pub use decoder::{Decoder, DecoderOptions};
pub use probe::GpuVendor;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("GStreamer error")]
    Glib(#[from] gstreamer::glib::Error),
    #[error("cannot read {0}")]
    Unreadable(PathBuf),
    #[error("failed to inspect {path}")]
    Discover {
        path: PathBuf,
        #[source]
        source: gstreamer::glib::Error,
    },
    #[error("no video stream in {0}")]
    NoVideoStream(PathBuf),
    #[error("no decoder available for {0}")]
    NoDecoder(String),
    #[error("failed to build decode pipeline: {0}")]
    Pipeline(String),
    #[error("decode pipeline did not start: {0}")]
    Preroll(String),
    #[error("decode error from {element}: {source}")]
    Stream {
        element: String,
        #[source]
        source: gstreamer::glib::Error,
    },
    #[error("decoder produced no frame for {0:?}")]
    Stalled(std::time::Duration),
    #[error("malformed decoded sample: {0}")]
    Sample(&'static str),
    #[error("seek to start failed")]
    Seek(#[source] gstreamer::glib::BoolError),
}

#[cfg(test)]
mod tests;
