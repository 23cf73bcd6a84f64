// SPDX-License-Identifier: MPL-2.0

//! DMA-BUF descriptors exported by the decoder.
//!
//! A decoded GPU surface arrives as one or more memory objects, each backed
//! by a dmabuf file descriptor, plus a per-plane layout. The renderer needs
//! one descriptor per plane, so planes sharing an object share ownership:
//!
//! | plane | object | descriptor            |
//! |-------|--------|-----------------------|
//! | Y     | 0      | dup of object 0       |
//! | UV    | 0      | `try_clone` of plane Y |
//!
//! Objects no plane refers to are closed right away.

use std::io;
use std::os::fd::OwnedFd;

use drm_fourcc::{DrmFourcc, DrmModifier};

/// Planes a single surface can carry.
pub const MAX_PLANES: usize = 4;

/// DRM fourcc and layout modifier of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBufFormat {
    pub fourcc: u32,
    pub modifier: u64,
}

impl DmaBufFormat {
    pub fn linear(fourcc: DrmFourcc) -> Self {
        Self {
            fourcc: fourcc as u32,
            modifier: DrmModifier::Linear.into(),
        }
    }

    /// Parse a caps `drm-format` string such as `NV12:0x0100000000000002`.
    /// A bare fourcc means the linear layout.
    pub fn from_drm_format(value: &str) -> Option<Self> {
        let (fourcc, modifier) = match value.split_once(':') {
            Some((fourcc, modifier)) => (fourcc, parse_modifier(modifier)?),
            None => (value, DrmModifier::Linear.into()),
        };

        Some(Self {
            fourcc: fourcc_from_str(fourcc)?,
            modifier,
        })
    }

    /// Map a GStreamer video format name to its DRM equivalent (linear).
    pub fn from_video_format(name: &str) -> Option<Self> {
        let fourcc = match name {
            "NV12" => DrmFourcc::Nv12,
            "NV21" => DrmFourcc::Nv21,
            "I420" => DrmFourcc::Yuv420,
            "YV12" => DrmFourcc::Yvu420,
            "P010_10LE" => DrmFourcc::P010,
            "BGRx" | "BGRX" => DrmFourcc::Xrgb8888,
            "BGRA" => DrmFourcc::Argb8888,
            // RGBA in GStreamer = ABGR8888 in DRM
            "RGBA" => DrmFourcc::Abgr8888,
            "RGBx" => DrmFourcc::Xbgr8888,
            _ => return None,
        };
        Some(Self::linear(fourcc))
    }

    /// Whether the CPU can read the planes without a de-tiling step.
    pub fn is_linear(&self) -> bool {
        normalize_modifier(self.modifier) == u64::from(DrmModifier::Linear)
    }
}

fn parse_modifier(value: &str) -> Option<u64> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn fourcc_from_str(value: &str) -> Option<u32> {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() > 4 || !bytes.iter().all(u8::is_ascii_graphic) {
        return None;
    }
    let mut code = [b' '; 4];
    code[..bytes.len()].copy_from_slice(bytes);
    Some(u32::from_le_bytes(code))
}

/// Printable form of a fourcc for logs, hex when it isn't ASCII.
pub fn fourcc_name(fourcc: u32) -> String {
    let bytes = fourcc.to_le_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        String::from_utf8_lossy(&bytes).trim_end().to_owned()
    } else {
        format!("{fourcc:#010x}")
    }
}

/// The invalid modifier means "implicit", which importers treat as linear.
pub fn normalize_modifier(modifier: u64) -> u64 {
    if modifier == u64::from(DrmModifier::Invalid) {
        DrmModifier::Linear.into()
    } else {
        modifier
    }
}

/// Where a plane lives: which memory object, and at what offset and stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub object: usize,
    pub offset: u32,
    pub stride: u32,
}

#[derive(Debug)]
pub struct DmaBufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
    pub modifier: u64,
}

/// Give every plane its own descriptor.
///
/// The first plane that references an object takes the object's descriptor;
/// later planes on the same object get a duplicate. Unreferenced objects are
/// dropped (closed) before returning, as is everything on error.
pub fn assign_planes(
    objects: Vec<OwnedFd>,
    layout: &[PlaneLayout],
    modifier: u64,
) -> io::Result<Vec<DmaBufPlane>> {
    if layout.is_empty() || layout.len() > MAX_PLANES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported plane count {}", layout.len()),
        ));
    }

    let mut first_plane = vec![None; objects.len()];
    let mut objects: Vec<Option<OwnedFd>> = objects.into_iter().map(Some).collect();
    let mut planes: Vec<DmaBufPlane> = Vec::with_capacity(layout.len());

    for (index, plane) in layout.iter().enumerate() {
        let owner = first_plane.get(plane.object).copied().flatten();
        let fd = if let Some(owner) = owner {
            planes[owner].fd.try_clone()?
        } else if let Some(fd) = objects.get_mut(plane.object).and_then(Option::take) {
            first_plane[plane.object] = Some(index);
            fd
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("plane {index} refers to missing object {}", plane.object),
            ));
        };

        planes.push(DmaBufPlane {
            fd,
            offset: plane.offset,
            stride: plane.stride,
            modifier,
        });
    }

    // remaining objects close here
    drop(objects);
    Ok(planes)
}
