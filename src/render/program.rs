// SPDX-License-Identifier: MPL-2.0

//! Shader programs for the two draw paths.
//!
//! Zero-copy frames are sampled through `samplerExternalOES`, which lets the
//! driver handle YUV conversion. Uploaded frames are NV12 in two textures
//! and are converted here with an explicit matrix.

use glow::HasContext;

use super::RenderError;
use crate::frame::{ColorMatrix, ColorRange};

pub const ATTRIB_POS: u32 = 0;
pub const ATTRIB_UV: u32 = 1;

const VERTEX: &str = r"#version 100
attribute vec2 a_pos;
attribute vec2 a_uv;
uniform vec4 u_transform;
uniform vec2 u_uv_scale;
varying vec2 v_uv;
void main() {
    v_uv = a_uv * u_uv_scale;
    gl_Position = vec4(a_pos * u_transform.xy + u_transform.zw, 0.0, 1.0);
}
";

const EXTERNAL: &str = r"#version 100
#extension GL_OES_EGL_image_external : require
precision mediump float;
uniform samplerExternalOES u_tex;
varying vec2 v_uv;
void main() {
    gl_FragColor = texture2D(u_tex, v_uv);
}
";

/// `{swizzle}` is `rg` for two-channel textures, `ra` for luminance-alpha.
const NV12: &str = r"#version 100
precision mediump float;
uniform sampler2D u_y;
uniform sampler2D u_uv;
uniform mat3 u_matrix;
uniform vec3 u_offset;
varying vec2 v_uv;
void main() {
    vec3 yuv = vec3(texture2D(u_y, v_uv).r, texture2D(u_uv, v_uv).{swizzle});
    gl_FragColor = vec4(clamp(u_matrix * (yuv - u_offset), 0.0, 1.0), 1.0);
}
";

/// Column-major YUV to RGB matrix and the offset subtracted first.
pub fn yuv_to_rgb(matrix: ColorMatrix, range: ColorRange) -> ([f32; 9], [f32; 3]) {
    let (cr, cgu, cgv, cb) = match matrix {
        ColorMatrix::Bt601 => (1.402, 0.344, 0.714, 1.772),
        ColorMatrix::Bt709 => (1.575, 0.187, 0.468, 1.856),
        ColorMatrix::Bt2020 => (1.475, 0.165, 0.571, 1.881),
    };

    let (offset, sy, suv) = match range {
        ColorRange::Limited => ([0.0627, 0.502, 0.502], 1.164, 1.138),
        ColorRange::Full => ([0.0, 0.5, 0.5], 1.0, 1.0),
    };

    // columns: Y, U, V
    let matrix = [
        sy,
        sy,
        sy,
        0.0,
        -cgu * suv,
        cb * suv,
        cr * suv,
        -cgv * suv,
        0.0,
    ];

    (matrix, offset)
}

pub struct ExternalProgram {
    pub program: glow::Program,
    pub transform: Option<glow::UniformLocation>,
    pub uv_scale: Option<glow::UniformLocation>,
}

impl ExternalProgram {
    pub fn new(gl: &glow::Context) -> Result<Self, RenderError> {
        let program = link(gl, EXTERNAL)?;
        unsafe {
            gl.use_program(Some(program));
            let sampler = gl.get_uniform_location(program, "u_tex");
            gl.uniform_1_i32(sampler.as_ref(), 0);
            Ok(Self {
                program,
                transform: gl.get_uniform_location(program, "u_transform"),
                uv_scale: gl.get_uniform_location(program, "u_uv_scale"),
            })
        }
    }
}

pub struct Nv12Program {
    pub program: glow::Program,
    pub transform: Option<glow::UniformLocation>,
    pub uv_scale: Option<glow::UniformLocation>,
    pub matrix: Option<glow::UniformLocation>,
    pub offset: Option<glow::UniformLocation>,
}

impl Nv12Program {
    pub fn new(gl: &glow::Context, rg_textures: bool) -> Result<Self, RenderError> {
        let swizzle = if rg_textures { "rg" } else { "ra" };
        let program = link(gl, &NV12.replace("{swizzle}", swizzle))?;
        unsafe {
            gl.use_program(Some(program));
            let y = gl.get_uniform_location(program, "u_y");
            let uv = gl.get_uniform_location(program, "u_uv");
            gl.uniform_1_i32(y.as_ref(), 0);
            gl.uniform_1_i32(uv.as_ref(), 1);
            Ok(Self {
                program,
                transform: gl.get_uniform_location(program, "u_transform"),
                uv_scale: gl.get_uniform_location(program, "u_uv_scale"),
                matrix: gl.get_uniform_location(program, "u_matrix"),
                offset: gl.get_uniform_location(program, "u_offset"),
            })
        }
    }
}

fn link(gl: &glow::Context, fragment: &str) -> Result<glow::Program, RenderError> {
    unsafe {
        let program = gl.create_program().map_err(RenderError::Gl)?;

        let mut shaders = Vec::with_capacity(2);
        for (kind, source) in [(glow::VERTEX_SHADER, VERTEX), (glow::FRAGMENT_SHADER, fragment)] {
            let shader = gl.create_shader(kind).map_err(RenderError::Gl)?;
            gl.shader_source(shader, source);
            gl.compile_shader(shader);
            if !gl.get_shader_compile_status(shader) {
                let log = gl.get_shader_info_log(shader);
                gl.delete_shader(shader);
                for shader in shaders {
                    gl.delete_shader(shader);
                }
                gl.delete_program(program);
                return Err(RenderError::Shader(log));
            }
            gl.attach_shader(program, shader);
            shaders.push(shader);
        }

        gl.bind_attrib_location(program, ATTRIB_POS, "a_pos");
        gl.bind_attrib_location(program, ATTRIB_UV, "a_uv");
        gl.link_program(program);

        for shader in shaders {
            gl.detach_shader(program, shader);
            gl.delete_shader(shader);
        }

        if !gl.get_program_link_status(program) {
            let log = gl.get_program_info_log(program);
            gl.delete_program(program);
            return Err(RenderError::Shader(log));
        }

        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(matrix: &[f32; 9], offset: &[f32; 3], yuv: [f32; 3]) -> [f32; 3] {
        let v = [yuv[0] - offset[0], yuv[1] - offset[1], yuv[2] - offset[2]];
        let mut rgb = [0.0; 3];
        for (row, out) in rgb.iter_mut().enumerate() {
            *out = (0..3).map(|col| matrix[col * 3 + row] * v[col]).sum::<f32>();
            *out = out.clamp(0.0, 1.0);
        }
        rgb
    }

    #[test]
    fn test_limited_range_black_and_white() {
        for matrix in [ColorMatrix::Bt601, ColorMatrix::Bt709, ColorMatrix::Bt2020] {
            let (m, o) = yuv_to_rgb(matrix, ColorRange::Limited);

            let black = apply(&m, &o, [16.0 / 255.0, 128.0 / 255.0, 128.0 / 255.0]);
            assert!(black.iter().all(|c| *c < 0.01), "{matrix:?} black {black:?}");

            let white = apply(&m, &o, [235.0 / 255.0, 128.0 / 255.0, 128.0 / 255.0]);
            assert!(white.iter().all(|c| *c > 0.99), "{matrix:?} white {white:?}");
        }
    }

    #[test]
    fn test_full_range_grey_is_neutral() {
        let (m, o) = yuv_to_rgb(ColorMatrix::Bt709, ColorRange::Full);
        let grey = apply(&m, &o, [0.5, 0.5, 0.5]);
        assert!(grey.iter().all(|c| (c - 0.5).abs() < 1e-4));
    }

    #[test]
    fn test_red_leans_on_v() {
        let (m, o) = yuv_to_rgb(ColorMatrix::Bt601, ColorRange::Full);
        let rgb = apply(&m, &o, [0.3, 0.5, 1.0]);
        assert!(rgb[0] > rgb[1] && rgb[0] > rgb[2]);
    }

    #[test]
    fn test_swizzle_substitution() {
        assert!(NV12.contains("{swizzle}"));
        assert!(NV12.replace("{swizzle}", "ra").contains(".ra)"));
    }
}
