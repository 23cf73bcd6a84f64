// SPDX-License-Identifier: MPL-2.0

//! `EGL_EXT_image_dma_buf_import` entry points.
//!
//! glutin doesn't wrap image creation, so the KHR functions are looked up
//! through `eglGetProcAddress` and called directly.

use std::ffi::{CStr, c_void};
use std::os::fd::AsRawFd;

use super::cache::{ImageImporter, ImportError, ImportRequest};
use crate::dmabuf::MAX_PLANES;
use crate::frame::{ColorMatrix, ColorRange};

pub const DMA_BUF_IMPORT: &str = "EGL_EXT_image_dma_buf_import";
pub const DMA_BUF_IMPORT_MODIFIERS: &str = "EGL_EXT_image_dma_buf_import_modifiers";

const EGL_NONE: i32 = 0x3038;
const EGL_WIDTH: i32 = 0x3057;
const EGL_HEIGHT: i32 = 0x3056;
const EGL_LINUX_DMA_BUF_EXT: u32 = 0x3270;
const EGL_LINUX_DRM_FOURCC_EXT: i32 = 0x3271;

const EGL_YUV_COLOR_SPACE_HINT_EXT: i32 = 0x327B;
const EGL_SAMPLE_RANGE_HINT_EXT: i32 = 0x327C;
const EGL_ITU_REC601_EXT: i32 = 0x327F;
const EGL_ITU_REC709_EXT: i32 = 0x3280;
const EGL_ITU_REC2020_EXT: i32 = 0x3281;
const EGL_YUV_FULL_RANGE_EXT: i32 = 0x3282;
const EGL_YUV_NARROW_RANGE_EXT: i32 = 0x3283;

/// Per plane: fd, offset, pitch, modifier low, modifier high.
const PLANE_ATTRIBS: [[i32; 5]; MAX_PLANES] = [
    [0x3272, 0x3273, 0x3274, 0x3443, 0x3444],
    [0x3275, 0x3276, 0x3277, 0x3445, 0x3446],
    [0x3278, 0x3279, 0x327A, 0x3447, 0x3448],
    [0x3440, 0x3441, 0x3442, 0x3449, 0x344A],
];

const INVALID_MODIFIER: u64 = 0x00ff_ffff_ffff_ffff;

type CreateImage =
    unsafe extern "system" fn(*const c_void, *const c_void, u32, *const c_void, *const i32) -> *const c_void;
type DestroyImage = unsafe extern "system" fn(*const c_void, *const c_void) -> u32;
type GetError = unsafe extern "system" fn() -> i32;

/// An `EGLImageKHR`. Belongs to the display, not to any context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EglImage(*const c_void);

impl EglImage {
    pub fn as_ptr(self) -> *const c_void {
        self.0
    }
}

pub struct EglImporter {
    display: *const c_void,
    create: CreateImage,
    destroy: DestroyImage,
    get_error: Option<GetError>,
    modifiers: bool,
}

impl EglImporter {
    /// Look up the image functions. `None` when the display can't import.
    ///
    /// # Safety
    ///
    /// `display` must be the initialized `EGLDisplay` that `lookup` resolves
    /// functions for, and must outlive the importer.
    pub unsafe fn new(
        display: *const c_void,
        modifiers: bool,
        lookup: impl Fn(&CStr) -> *const c_void,
    ) -> Option<Self> {
        let create = lookup(c"eglCreateImageKHR");
        let destroy = lookup(c"eglDestroyImageKHR");
        let get_error = lookup(c"eglGetError");
        if display.is_null() || create.is_null() || destroy.is_null() {
            return None;
        }

        // SAFETY: non-null addresses returned for these names have these signatures.
        unsafe {
            Some(Self {
                display,
                create: std::mem::transmute::<*const c_void, CreateImage>(create),
                destroy: std::mem::transmute::<*const c_void, DestroyImage>(destroy),
                get_error: (!get_error.is_null())
                    .then(|| std::mem::transmute::<*const c_void, GetError>(get_error)),
                modifiers,
            })
        }
    }

    fn last_error(&self) -> i32 {
        // SAFETY: eglGetError takes no arguments.
        self.get_error.map_or(0, |get_error| unsafe { get_error() })
    }
}

impl ImageImporter for EglImporter {
    type Image = EglImage;

    fn supports_modifiers(&self) -> bool {
        self.modifiers
    }

    fn import(&mut self, request: &ImportRequest<'_>) -> Result<EglImage, ImportError> {
        let attribs = dmabuf_attributes(request, self.modifiers)?;

        // SAFETY: the attribute list is EGL_NONE terminated and the plane
        // descriptors stay open for the duration of the call.
        let image = unsafe {
            (self.create)(
                self.display,
                std::ptr::null(),
                EGL_LINUX_DMA_BUF_EXT,
                std::ptr::null(),
                attribs.as_ptr(),
            )
        };

        if image.is_null() {
            return Err(ImportError::Egl(self.last_error()));
        }
        Ok(EglImage(image))
    }

    fn destroy(&mut self, image: EglImage) {
        // SAFETY: the image was created on this display and is destroyed once.
        unsafe {
            (self.destroy)(self.display, image.0);
        }
    }
}

/// Attribute list for `eglCreateImageKHR`.
///
/// Modifiers are split into two 32-bit halves and passed bit for bit. The
/// implicit modifier is left out so the driver picks the layout.
pub fn dmabuf_attributes(
    request: &ImportRequest<'_>,
    modifiers: bool,
) -> Result<Vec<i32>, ImportError> {
    let planes = request.planes.len();
    if planes == 0 || planes > MAX_PLANES || (planes == MAX_PLANES && !modifiers) {
        return Err(ImportError::TooManyPlanes(planes));
    }

    let mut attribs = vec![
        EGL_WIDTH,
        request.width as i32,
        EGL_HEIGHT,
        request.height as i32,
        EGL_LINUX_DRM_FOURCC_EXT,
        request.format.fourcc as i32,
    ];

    for (plane, names) in request.planes.iter().zip(PLANE_ATTRIBS) {
        attribs.extend([
            names[0],
            plane.fd.as_raw_fd(),
            names[1],
            plane.offset as i32,
            names[2],
            plane.stride as i32,
        ]);
        if modifiers && plane.modifier != INVALID_MODIFIER {
            attribs.extend([
                names[3],
                (plane.modifier & 0xffff_ffff) as u32 as i32,
                names[4],
                (plane.modifier >> 32) as u32 as i32,
            ]);
        }
    }

    let color_space = match request.matrix {
        ColorMatrix::Bt601 => EGL_ITU_REC601_EXT,
        ColorMatrix::Bt709 => EGL_ITU_REC709_EXT,
        ColorMatrix::Bt2020 => EGL_ITU_REC2020_EXT,
    };
    let range = match request.range {
        ColorRange::Limited => EGL_YUV_NARROW_RANGE_EXT,
        ColorRange::Full => EGL_YUV_FULL_RANGE_EXT,
    };
    attribs.extend([
        EGL_YUV_COLOR_SPACE_HINT_EXT,
        color_space,
        EGL_SAMPLE_RANGE_HINT_EXT,
        range,
        EGL_NONE,
    ]);

    Ok(attribs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmabuf::{DmaBufFormat, DmaBufPlane};
    use drm_fourcc::DrmFourcc;
    use std::os::fd::OwnedFd;

    fn plane(offset: u32, modifier: u64) -> DmaBufPlane {
        DmaBufPlane {
            fd: OwnedFd::from(std::fs::File::open("/dev/null").unwrap()),
            offset,
            stride: 2048,
            modifier,
        }
    }

    fn request(planes: &[DmaBufPlane]) -> ImportRequest<'_> {
        ImportRequest {
            width: 1920,
            height: 1080,
            format: DmaBufFormat::linear(DrmFourcc::Nv12),
            planes,
            matrix: ColorMatrix::Bt709,
            range: ColorRange::Limited,
        }
    }

    fn value_of(attribs: &[i32], name: i32) -> Option<i32> {
        attribs
            .chunks(2)
            .find(|pair| pair[0] == name)
            .and_then(|pair| pair.get(1).copied())
    }

    #[test]
    fn test_nv12_attributes() {
        let planes = [plane(0, 0), plane(2048 * 1088, 0)];
        let attribs = dmabuf_attributes(&request(&planes), false).unwrap();

        assert_eq!(attribs.last(), Some(&EGL_NONE));
        assert_eq!(value_of(&attribs, EGL_WIDTH), Some(1920));
        assert_eq!(value_of(&attribs, EGL_LINUX_DRM_FOURCC_EXT), Some(DrmFourcc::Nv12 as i32));
        assert_eq!(value_of(&attribs, 0x3276), Some(2048 * 1088));
        assert_eq!(value_of(&attribs, EGL_YUV_COLOR_SPACE_HINT_EXT), Some(EGL_ITU_REC709_EXT));
        assert_eq!(value_of(&attribs, EGL_SAMPLE_RANGE_HINT_EXT), Some(EGL_YUV_NARROW_RANGE_EXT));
        // no modifier attributes without the extension
        assert_eq!(value_of(&attribs, 0x3443), None);
    }

    #[test]
    fn test_modifier_halves_keep_every_bit() {
        let modifier = 0x8000_0001_ffff_fffe;
        let planes = [plane(0, modifier)];
        let attribs = dmabuf_attributes(&request(&planes), true).unwrap();

        let lo = value_of(&attribs, 0x3443).unwrap() as u32 as u64;
        let hi = value_of(&attribs, 0x3444).unwrap() as u32 as u64;
        assert_eq!(hi << 32 | lo, modifier);
    }

    #[test]
    fn test_implicit_modifier_is_omitted() {
        let planes = [plane(0, INVALID_MODIFIER)];
        let attribs = dmabuf_attributes(&request(&planes), true).unwrap();
        assert_eq!(value_of(&attribs, 0x3443), None);
    }

    #[test]
    fn test_fourth_plane_needs_modifiers() {
        let planes = [plane(0, 0), plane(1, 0), plane(2, 0), plane(3, 0)];
        assert!(matches!(
            dmabuf_attributes(&request(&planes), false),
            Err(ImportError::TooManyPlanes(4))
        ));

        let attribs = dmabuf_attributes(&request(&planes), true).unwrap();
        assert_eq!(value_of(&attribs, 0x3441), Some(3));
    }
}
