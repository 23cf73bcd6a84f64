// SPDX-License-Identifier: MPL-2.0

//! GLES2 renderer shared by every output.
//!
//! One EGL context draws to a window surface per output. Frames reach the
//! screen on one of two paths:
//!
//! - **zero-copy**: the decoder's dmabuf is imported as an `EGLImage` and
//!   sampled through `samplerExternalOES`.
//! - **upload**: the CPU copy in the [`FrameRing`] is uploaded as a luma
//!   and a chroma texture and converted in the fragment shader.

pub mod cache;
pub mod egl;
pub mod program;
pub mod transform;

use std::ffi::{CString, c_void};
use std::num::NonZeroU32;
use std::ptr::NonNull;

use cosmic_bg_video_config::ScaleMode;
use glow::HasContext;
use glutin::api::egl::config::Config;
use glutin::api::egl::context::PossiblyCurrentContext;
use glutin::api::egl::display::Display;
use glutin::api::egl::surface::Surface;
use glutin::config::{Api, ConfigSurfaceTypes, ConfigTemplateBuilder};
use glutin::context::{ContextApi, ContextAttributesBuilder, Version};
use glutin::display::{AsRawDisplay, GetDisplayExtensions, RawDisplay};
use glutin::prelude::*;
use glutin::surface::{SurfaceAttributesBuilder, SwapInterval, WindowSurface};
use raw_window_handle::{
    RawDisplayHandle, RawWindowHandle, WaylandDisplayHandle, WaylandWindowHandle,
};
use sctk::reexports::client::{Connection, Proxy, protocol::wl_surface::WlSurface};

use self::cache::{ImageCache, ImportError, ImportRequest, ImportStatus};
use self::egl::{DMA_BUF_IMPORT, DMA_BUF_IMPORT_MODIFIERS, EglImporter};
use self::program::{ATTRIB_POS, ATTRIB_UV, ExternalProgram, Nv12Program, yuv_to_rgb};
use self::transform::{Transform, scale_transform};
use crate::frame::{Frame, GpuSurface};
use crate::ring::{FrameRing, SlotIndex};
use crate::video::GpuVendor;

const TEXTURE_EXTERNAL_OES: u32 = 0x8D65;

/// x, y, u, v as a triangle strip.
const QUAD: [f32; 16] = [
    -1.0, -1.0, 0.0, 1.0, //
    1.0, -1.0, 1.0, 1.0, //
    -1.0, 1.0, 0.0, 0.0, //
    1.0, 1.0, 1.0, 0.0,
];
const QUAD_STRIDE: i32 = 16;

type ImageTargetTexture = unsafe extern "system" fn(u32, *const c_void);

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("EGL setup failed: {0}")]
    Egl(#[from] glutin::error::Error),
    #[error("no EGL config with GLES2 window surfaces")]
    NoConfig,
    #[error("wayland handle is null")]
    NullHandle,
    #[error("GL object creation failed: {0}")]
    Gl(String),
    #[error("shader build failed: {0}")]
    Shader(String),
    #[error("surface size {0}x{1} is empty")]
    EmptySurface(u32, u32),
    #[error("output surface lost: {0}")]
    Surface(#[source] glutin::error::Error),
}

impl RenderError {
    /// The context itself is gone, not just one output's surface.
    pub fn is_context_lost(&self) -> bool {
        match self {
            RenderError::Egl(why) | RenderError::Surface(why) => {
                matches!(why.error_kind(), glutin::error::ErrorKind::ContextLost)
            }
            _ => false,
        }
    }
}

/// Which path put the frame on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawPath {
    ZeroCopy,
    Upload,
    /// Nothing drawable; the output was cleared to black.
    Blank,
}

/// The render path chosen by the first draw.
///
/// Until something has been drawn both paths stay open. After that the
/// choice sticks until the renderer is rebuilt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PathLock {
    determined: bool,
    zero_copy: bool,
}

impl PathLock {
    pub fn is_determined(&self) -> bool {
        self.determined
    }

    pub fn try_zero_copy(&self) -> bool {
        !self.determined || self.zero_copy
    }

    /// NVIDIA surfaces get a CPU copy regardless, their exports can fail to
    /// import at any time.
    pub fn wants_cpu_copy(&self, decode_vendor: GpuVendor) -> bool {
        !self.determined || !self.zero_copy || !decode_vendor.imports_reliably()
    }

    /// Lock the path from the first draw. Returns the export verdict for the
    /// decoder when the draw actually tested a surface.
    pub fn record(&mut self, had_surface: bool, tried: bool, drawn: DrawPath) -> Option<bool> {
        if self.determined {
            return None;
        }
        self.determined = true;

        if had_surface && tried {
            self.zero_copy = drawn == DrawPath::ZeroCopy;
            tracing::info!(
                path = if self.zero_copy { "zero-copy" } else { "upload" },
                "Render path locked"
            );
            Some(self.zero_copy)
        } else {
            self.zero_copy = false;
            tracing::info!(path = "upload", "Render path locked");
            None
        }
    }
}

/// The EGL side of an output.
pub struct OutputSurface {
    surface: Surface<WindowSurface>,
    wl_surface: WlSurface,
    width: u32,
    height: u32,
}

impl OutputSurface {
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The Wayland surface the EGL surface presents to.
    pub fn wl_surface(&self) -> &WlSurface {
        &self.wl_surface
    }
}

struct Textures {
    luma: glow::Texture,
    chroma: glow::Texture,
    external: Option<glow::Texture>,
    /// Dimensions the upload textures were last allocated at.
    upload_size: Option<(u32, u32)>,
}

pub struct Renderer {
    // images belong to the display and go before it
    cache: Option<ImageCache<EglImporter>>,
    image_target: Option<ImageTargetTexture>,
    gl: glow::Context,
    external: Option<ExternalProgram>,
    nv12: Nv12Program,
    quad: glow::Buffer,
    textures: Textures,
    rg_textures: bool,
    vendor: GpuVendor,
    description: String,
    frames_drawn: u64,
    context: PossiblyCurrentContext,
    config: Config,
    display: Display,
}

impl Renderer {
    pub fn new(connection: &Connection) -> Result<Self, RenderError> {
        let display_ptr = NonNull::new(connection.backend().display_ptr().cast::<c_void>())
            .ok_or(RenderError::NullHandle)?;
        let handle = RawDisplayHandle::Wayland(WaylandDisplayHandle::new(display_ptr));

        // SAFETY: the connection outlives the renderer.
        let display = unsafe { Display::new(handle)? };

        let template = ConfigTemplateBuilder::new()
            .with_api(Api::GLES2)
            .with_surface_type(ConfigSurfaceTypes::WINDOW)
            .build();
        // SAFETY: the template carries no native window.
        let config = unsafe { display.find_configs(template)? }
            .next()
            .ok_or(RenderError::NoConfig)?;

        let attributes = ContextAttributesBuilder::new()
            .with_context_api(ContextApi::Gles(Some(Version::new(2, 0))))
            .build(None);
        // SAFETY: config was produced by this display.
        let context =
            unsafe { display.create_context(&config, &attributes)? }.make_current_surfaceless()?;

        // SAFETY: the context is current and the loader returns its entry points.
        let gl = unsafe {
            glow::Context::from_loader_function(|name| {
                CString::new(name)
                    .map_or(std::ptr::null(), |name| display.get_proc_address(&name))
            })
        };

        let description = unsafe { gl.get_parameter_string(glow::RENDERER) };
        let vendor = GpuVendor::from_description(&description);
        let rg_textures = gl.supported_extensions().contains("GL_EXT_texture_rg");
        let external_sampler = gl.supported_extensions().contains("GL_OES_EGL_image_external");

        let image_target = display.get_proc_address(c"glEGLImageTargetTexture2DOES");
        let image_target = (!image_target.is_null()).then(|| {
            // SAFETY: the address was resolved for this exact name.
            unsafe { std::mem::transmute::<*const c_void, ImageTargetTexture>(image_target) }
        });

        let extensions = display.extensions();
        let importer = match display.raw_display() {
            RawDisplay::Egl(raw) if extensions.contains(DMA_BUF_IMPORT) => {
                // SAFETY: raw is this display's EGLDisplay, which outlives the cache.
                unsafe {
                    EglImporter::new(raw, extensions.contains(DMA_BUF_IMPORT_MODIFIERS), |name| {
                        display.get_proc_address(name)
                    })
                }
            }
            #[allow(unreachable_patterns)]
            _ => None,
        };

        let external = if external_sampler && image_target.is_some() && importer.is_some() {
            match ExternalProgram::new(&gl) {
                Ok(program) => Some(program),
                Err(why) => {
                    tracing::warn!(%why, "External image shader unavailable");
                    None
                }
            }
        } else {
            None
        };
        let nv12 = Nv12Program::new(&gl, rg_textures)?;

        let (quad, textures) = unsafe { create_objects(&gl, external.is_some())? };

        tracing::info!(
            renderer = %description,
            %vendor,
            zero_copy = external.is_some(),
            modifiers = extensions.contains(DMA_BUF_IMPORT_MODIFIERS),
            rg_textures,
            "Renderer ready"
        );

        Ok(Self {
            cache: importer.filter(|_| external.is_some()).map(ImageCache::new),
            image_target,
            gl,
            external,
            nv12,
            quad,
            textures,
            rg_textures,
            vendor,
            description,
            frames_drawn: 0,
            context,
            config,
            display,
        })
    }

    pub fn vendor(&self) -> GpuVendor {
        self.vendor
    }

    /// `GL_RENDERER` string.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn import_status(&self) -> ImportStatus {
        self.cache
            .as_ref()
            .map_or(ImportStatus::Broken, ImageCache::status)
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    pub fn images_imported(&self) -> u64 {
        self.cache.as_ref().map_or(0, ImageCache::imports)
    }

    /// Destroy every imported image, e.g. after a seek.
    pub fn clear_cache(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
    }

    /// Create the EGL window surface for a configured layer surface.
    pub fn create_surface(
        &self,
        wl_surface: &WlSurface,
        width: u32,
        height: u32,
    ) -> Result<OutputSurface, RenderError> {
        let (Some(w), Some(h)) = (NonZeroU32::new(width), NonZeroU32::new(height)) else {
            return Err(RenderError::EmptySurface(width, height));
        };

        let surface_ptr = NonNull::new(wl_surface.id().as_ptr().cast::<c_void>())
            .ok_or(RenderError::NullHandle)?;
        let handle = RawWindowHandle::Wayland(WaylandWindowHandle::new(surface_ptr));
        let attributes = SurfaceAttributesBuilder::<WindowSurface>::new().build(handle, w, h);

        // SAFETY: outputs drop the EGL surface before the wl_surface.
        let surface = unsafe { self.display.create_window_surface(&self.config, &attributes)? };

        self.context.make_current(&surface)?;
        // frame callbacks pace us; a blocking swap would stall every output
        if let Err(why) = surface.set_swap_interval(&self.context, SwapInterval::DontWait) {
            tracing::debug!(?why, "Swap interval not set");
        }

        Ok(OutputSurface {
            surface,
            wl_surface: wl_surface.clone(),
            width,
            height,
        })
    }

    pub fn resize_surface(
        &self,
        target: &mut OutputSurface,
        width: u32,
        height: u32,
    ) -> Result<(), RenderError> {
        let (Some(w), Some(h)) = (NonZeroU32::new(width), NonZeroU32::new(height)) else {
            return Err(RenderError::EmptySurface(width, height));
        };
        if target.size() == (width, height) {
            return Ok(());
        }

        self.context
            .make_current(&target.surface)
            .map_err(RenderError::Surface)?;
        target.surface.resize(&self.context, w, h);
        target.width = width;
        target.height = height;
        Ok(())
    }

    /// Draw `frame` on `target` and present it.
    ///
    /// Zero-copy is tried first when asked for; any failure there falls
    /// back to the CPU copy. With neither available the output is cleared.
    pub fn draw(
        &mut self,
        target: &OutputSurface,
        frame: &Frame,
        ring: &FrameRing,
        scale: ScaleMode,
        try_zero_copy: bool,
    ) -> Result<DrawPath, RenderError> {
        self.context
            .make_current(&target.surface)
            .map_err(RenderError::Surface)?;

        unsafe {
            self.gl
                .viewport(0, 0, target.width as i32, target.height as i32);
            self.gl.clear_color(0.0, 0.0, 0.0, 1.0);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
        self.frames_drawn += 1;

        let transform = scale_transform(
            scale,
            (frame.width, frame.height),
            (target.width, target.height),
        );

        let mut path = DrawPath::Blank;
        if let Some(surface) = frame.surface().filter(|_| try_zero_copy) {
            if self.draw_image(frame, surface, transform) {
                path = DrawPath::ZeroCopy;
            }
        }
        if path == DrawPath::Blank {
            if let Some(slot) = frame.cpu_slot() {
                self.draw_upload(frame, ring, slot, transform);
                path = DrawPath::Upload;
            }
        }

        target
            .surface
            .swap_buffers(&self.context)
            .map_err(RenderError::Surface)?;

        Ok(path)
    }

    fn draw_image(&mut self, frame: &Frame, surface: &GpuSurface, transform: Transform) -> bool {
        let (Some(cache), Some(program), Some(image_target), Some(texture)) = (
            self.cache.as_mut(),
            self.external.as_ref(),
            self.image_target,
            self.textures.external,
        ) else {
            return false;
        };

        let request = ImportRequest::new(surface, frame.width, frame.height, frame.matrix, frame.range);
        let image = match cache.get_or_import(surface.identity, surface.generation, &request) {
            Ok(image) => image,
            Err(ImportError::Unsupported) => return false,
            Err(why) => {
                tracing::debug!(%why, identity = surface.identity, "Surface import failed");
                return false;
            }
        };

        let gl = &self.gl;
        unsafe {
            gl.use_program(Some(program.program));
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(TEXTURE_EXTERNAL_OES, Some(texture));
            image_target(TEXTURE_EXTERNAL_OES, image.as_ptr());

            let error = gl.get_error();
            if error != glow::NO_ERROR {
                tracing::debug!(error, "Binding imported image failed");
                return false;
            }

            gl.uniform_4_f32_slice(program.transform.as_ref(), &transform);
            gl.uniform_2_f32(program.uv_scale.as_ref(), 1.0, 1.0);
            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
        }

        true
    }

    fn draw_upload(&mut self, frame: &Frame, ring: &FrameRing, slot: SlotIndex, transform: Transform) {
        let size = (ring.width(), ring.height());
        let luma_width = ring.y_stride() as i32;
        let chroma_width = (ring.uv_stride() / 2) as i32;
        let luma_height = size.1 as i32;
        let chroma_height = size.1.div_ceil(2) as i32;
        let (luma_format, chroma_format) = if self.rg_textures {
            (glow::RED, glow::RG)
        } else {
            (glow::LUMINANCE, glow::LUMINANCE_ALPHA)
        };
        let reallocate = self.textures.upload_size != Some(size);
        let (matrix, offset) = yuv_to_rgb(frame.matrix, frame.range);

        let gl = &self.gl;
        let planes = [
            (glow::TEXTURE0, self.textures.luma, luma_format, luma_width, luma_height, ring.luma(slot)),
            (glow::TEXTURE1, self.textures.chroma, chroma_format, chroma_width, chroma_height, ring.chroma(slot)),
        ];

        unsafe {
            for (unit, texture, format, width, height, data) in planes {
                gl.active_texture(unit);
                gl.bind_texture(glow::TEXTURE_2D, Some(texture));
                if reallocate {
                    gl.tex_image_2d(
                        glow::TEXTURE_2D,
                        0,
                        format as i32,
                        width,
                        height,
                        0,
                        format,
                        glow::UNSIGNED_BYTE,
                        Some(data),
                    );
                } else {
                    gl.tex_sub_image_2d(
                        glow::TEXTURE_2D,
                        0,
                        0,
                        0,
                        width,
                        height,
                        format,
                        glow::UNSIGNED_BYTE,
                        glow::PixelUnpackData::Slice(data),
                    );
                }
            }

            let program = &self.nv12;
            gl.use_program(Some(program.program));
            gl.uniform_4_f32_slice(program.transform.as_ref(), &transform);
            gl.uniform_2_f32(
                program.uv_scale.as_ref(),
                size.0 as f32 / ring.y_stride().max(1) as f32,
                1.0,
            );
            gl.uniform_matrix_3_f32_slice(program.matrix.as_ref(), false, &matrix);
            gl.uniform_3_f32(program.offset.as_ref(), offset[0], offset[1], offset[2]);
            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
            gl.active_texture(glow::TEXTURE0);
        }

        if reallocate {
            tracing::debug!(width = size.0, height = size.1, "Upload textures allocated");
            self.textures.upload_size = Some(size);
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.cache = None;
        unsafe {
            let textures = [self.textures.luma, self.textures.chroma];
            for texture in textures.into_iter().chain(self.textures.external) {
                self.gl.delete_texture(texture);
            }
            self.gl.delete_buffer(self.quad);
            self.gl.delete_program(self.nv12.program);
            if let Some(external) = &self.external {
                self.gl.delete_program(external.program);
            }
        }
    }
}

/// Quad buffer, attribute layout and the three textures.
unsafe fn create_objects(
    gl: &glow::Context,
    external: bool,
) -> Result<(glow::Buffer, Textures), RenderError> {
    unsafe {
        let quad = gl.create_buffer().map_err(RenderError::Gl)?;
        let bytes: Vec<u8> = QUAD.iter().flat_map(|v| v.to_ne_bytes()).collect();
        gl.bind_buffer(glow::ARRAY_BUFFER, Some(quad));
        gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, &bytes, glow::STATIC_DRAW);

        // one context, one layout: set once
        gl.enable_vertex_attrib_array(ATTRIB_POS);
        gl.vertex_attrib_pointer_f32(ATTRIB_POS, 2, glow::FLOAT, false, QUAD_STRIDE, 0);
        gl.enable_vertex_attrib_array(ATTRIB_UV);
        gl.vertex_attrib_pointer_f32(ATTRIB_UV, 2, glow::FLOAT, false, QUAD_STRIDE, 8);

        let texture = |target: u32| -> Result<glow::Texture, RenderError> {
            let texture = gl.create_texture().map_err(RenderError::Gl)?;
            gl.bind_texture(target, Some(texture));
            for (name, value) in [
                (glow::TEXTURE_MIN_FILTER, glow::LINEAR),
                (glow::TEXTURE_MAG_FILTER, glow::LINEAR),
                (glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE),
                (glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE),
            ] {
                gl.tex_parameter_i32(target, name, value as i32);
            }
            Ok(texture)
        };

        let textures = Textures {
            luma: texture(glow::TEXTURE_2D)?,
            chroma: texture(glow::TEXTURE_2D)?,
            external: external.then(|| texture(TEXTURE_EXTERNAL_OES)).transpose()?,
            upload_size: None,
        };

        Ok((quad, textures))
    }
}
