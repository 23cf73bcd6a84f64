// SPDX-License-Identifier: MPL-2.0

//! The frame handed from the decoder to the renderer.
//!
//! A single [`Frame`] lives for the whole run and is overwritten by every
//! decode. Its payload is either an exported GPU surface (optionally with a
//! CPU copy in the ring as well) or a ring slot alone.

use crate::dmabuf::{DmaBufFormat, DmaBufPlane};
use crate::ring::SlotIndex;

/// YUV to RGB matrix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorMatrix {
    #[default]
    Bt601,
    Bt709,
    Bt2020,
}

impl ColorMatrix {
    /// Best guess for streams that don't say.
    pub fn guess_for_width(width: u32) -> Self {
        if width >= 1280 {
            ColorMatrix::Bt709
        } else {
            ColorMatrix::Bt601
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorRange {
    #[default]
    Limited,
    Full,
}

/// An exported decoder surface. Owns its plane descriptors.
#[derive(Debug)]
pub struct GpuSurface {
    /// Stable for as long as the decoder recycles the same surface.
    pub identity: u64,
    pub generation: u64,
    pub format: DmaBufFormat,
    pub planes: Vec<DmaBufPlane>,
    /// Keeps the decoder from reusing the surface while it is displayed.
    pub(crate) keepalive: Option<gstreamer::Buffer>,
}

#[derive(Debug, Default)]
pub enum Payload {
    #[default]
    Empty,
    Surface {
        surface: GpuSurface,
        cpu: Option<SlotIndex>,
    },
    Ring(SlotIndex),
}

#[derive(Debug, Default)]
pub struct Frame {
    /// Presentation time in seconds.
    pub pts: f64,
    pub width: u32,
    pub height: u32,
    pub matrix: ColorMatrix,
    pub range: ColorRange,
    pub payload: Payload,
}

impl Frame {
    pub fn surface(&self) -> Option<&GpuSurface> {
        match &self.payload {
            Payload::Surface { surface, .. } => Some(surface),
            Payload::Ring(_) | Payload::Empty => None,
        }
    }

    /// Ring slot holding a CPU-visible copy, if one was made.
    pub fn cpu_slot(&self) -> Option<SlotIndex> {
        match self.payload {
            Payload::Surface { cpu, .. } => cpu,
            Payload::Ring(slot) => Some(slot),
            Payload::Empty => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.payload, Payload::Empty)
    }

    /// Close the surface descriptors and drop the decoder reference.
    /// A CPU copy, if any, stays usable.
    pub fn release(&mut self) {
        self.payload = match std::mem::take(&mut self.payload) {
            Payload::Surface { cpu: Some(slot), .. } | Payload::Ring(slot) => Payload::Ring(slot),
            Payload::Surface { cpu: None, .. } | Payload::Empty => Payload::Empty,
        };
    }
}
