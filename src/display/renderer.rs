//! Textured quad on an OpenGL 3.3 core context.

use color_eyre::{eyre::eyre, Result};
use glam::Mat4;
use glow::HasContext;
use tracing::{debug, info};

use crate::capture::frame::Surface;

const VERTEX_SHADER: &str = r#"#version 330 core
layout(location = 0) in vec2 a_pos;
layout(location = 1) in vec2 a_uv;
uniform mat4 u_mvp;
out vec2 v_uv;
void main() {
    v_uv = a_uv;
    gl_Position = u_mvp * vec4(a_pos, 0.0, 1.0);
}
"#;

const FRAGMENT_SHADER: &str = r#"#version 330 core
in vec2 v_uv;
uniform sampler2D u_frame;
out vec4 color;
void main() {
    color = vec4(texture(u_frame, v_uv).rgb, 1.0);
}
"#;

/// Unit quad as a triangle strip: `x, y, u, v`. The surface is top-down, so
/// the top edge samples `v = 0`.
#[rustfmt::skip]
const QUAD: [f32; 16] = [
    -1.0, -1.0, 0.0, 1.0,
     1.0, -1.0, 1.0, 1.0,
    -1.0,  1.0, 0.0, 0.0,
     1.0,  1.0, 1.0, 0.0,
];

pub struct QuadRenderer {
    program: glow::Program,
    vao: glow::VertexArray,
    vbo: glow::Buffer,
    texture: glow::Texture,
    mvp: Option<glow::UniformLocation>,
    /// Dimensions the texture storage was last specified with.
    texture_size: Option<(u32, u32)>,
}

unsafe fn compile(gl: &glow::Context, kind: u32, source: &str) -> Result<glow::Shader> {
    let shader = gl.create_shader(kind).map_err(|e| eyre!(e))?;
    gl.shader_source(shader, source);
    gl.compile_shader(shader);
    if !gl.get_shader_compile_status(shader) {
        let log = gl.get_shader_info_log(shader);
        gl.delete_shader(shader);
        return Err(eyre!("shader compilation failed: {}", log));
    }
    Ok(shader)
}

impl QuadRenderer {
    pub fn new(gl: &glow::Context) -> Result<Self> {
        // SAFETY: called with the context current on this thread.
        unsafe {
            let vertex = compile(gl, glow::VERTEX_SHADER, VERTEX_SHADER)?;
            let fragment = compile(gl, glow::FRAGMENT_SHADER, FRAGMENT_SHADER)?;
            let program = gl.create_program().map_err(|e| eyre!(e))?;
            gl.attach_shader(program, vertex);
            gl.attach_shader(program, fragment);
            gl.link_program(program);
            gl.detach_shader(program, vertex);
            gl.detach_shader(program, fragment);
            gl.delete_shader(vertex);
            gl.delete_shader(fragment);
            if !gl.get_program_link_status(program) {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                return Err(eyre!("program link failed: {}", log));
            }

            let vao = gl.create_vertex_array().map_err(|e| eyre!(e))?;
            let vbo = gl.create_buffer().map_err(|e| eyre!(e))?;
            gl.bind_vertex_array(Some(vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            let bytes: Vec<u8> = QUAD.iter().flat_map(|f| f.to_ne_bytes()).collect();
            gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, &bytes, glow::STATIC_DRAW);
            let stride = 4 * std::mem::size_of::<f32>() as i32;
            gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, stride, 0);
            gl.enable_vertex_attrib_array(0);
            gl.vertex_attrib_pointer_f32(1, 2, glow::FLOAT, false, stride, 2 * 4);
            gl.enable_vertex_attrib_array(1);
            gl.bind_vertex_array(None);

            let texture = gl.create_texture().map_err(|e| eyre!(e))?;
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            for (param, value) in [
                (glow::TEXTURE_MIN_FILTER, glow::LINEAR),
                (glow::TEXTURE_MAG_FILTER, glow::LINEAR),
                (glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE),
                (glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE),
            ] {
                gl.tex_parameter_i32(glow::TEXTURE_2D, param, value as i32);
            }
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);

            gl.use_program(Some(program));
            let sampler = gl.get_uniform_location(program, "u_frame");
            gl.uniform_1_i32(sampler.as_ref(), 0);
            let mvp = gl.get_uniform_location(program, "u_mvp");

            gl.enable(glow::DEPTH_TEST);
            info!("GL renderer ready");

            Ok(Self {
                program,
                vao,
                vbo,
                texture,
                mvp,
                texture_size: None,
            })
        }
    }

    /// `width / height` of the last uploaded frame.
    pub fn frame_aspect(&self) -> f32 {
        match self.texture_size {
            Some((w, h)) if h > 0 => w as f32 / h as f32,
            _ => 16.0 / 9.0,
        }
    }

    /// Copy `surface` into the texture, re-specifying storage when asked to
    /// or when nothing has been allocated yet.
    pub fn upload(&mut self, gl: &glow::Context, surface: &Surface, respecify: bool) {
        let (w, h) = (surface.width, surface.height);
        if w == 0 || h == 0 || surface.data.len() < w as usize * h as usize * 3 {
            return;
        }
        // SAFETY: context current; data holds w*h*3 bytes with alignment 1.
        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, Some(self.texture));
            if respecify || self.texture_size != Some((w, h)) {
                debug!("Texture storage {}x{}", w, h);
                gl.tex_image_2d(
                    glow::TEXTURE_2D,
                    0,
                    glow::RGB8 as i32,
                    w as i32,
                    h as i32,
                    0,
                    glow::RGB,
                    glow::UNSIGNED_BYTE,
                    Some(&surface.data),
                );
                self.texture_size = Some((w, h));
            } else {
                gl.tex_sub_image_2d(
                    glow::TEXTURE_2D,
                    0,
                    0,
                    0,
                    w as i32,
                    h as i32,
                    glow::RGB,
                    glow::UNSIGNED_BYTE,
                    glow::PixelUnpackData::Slice(&surface.data),
                );
            }
        }
    }

    /// Clear and, unless `visible` is false or nothing was uploaded, draw the quad.
    pub fn draw(&self, gl: &glow::Context, viewport: (u32, u32), mvp: &Mat4, visible: bool) {
        // SAFETY: context current.
        unsafe {
            gl.viewport(0, 0, viewport.0 as i32, viewport.1 as i32);
            gl.clear_color(0.0, 0.0, 0.0, 1.0);
            gl.clear(glow::COLOR_BUFFER_BIT | glow::DEPTH_BUFFER_BIT);
            if !visible || self.texture_size.is_none() {
                return;
            }
            gl.use_program(Some(self.program));
            gl.uniform_matrix_4_f32_slice(self.mvp.as_ref(), false, &mvp.to_cols_array());
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(glow::TEXTURE_2D, Some(self.texture));
            gl.bind_vertex_array(Some(self.vao));
            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
            gl.bind_vertex_array(None);
        }
    }

    pub fn destroy(self, gl: &glow::Context) {
        // SAFETY: context current; objects were created on it.
        unsafe {
            gl.delete_texture(self.texture);
            gl.delete_buffer(self.vbo);
            gl.delete_vertex_array(self.vao);
            gl.delete_program(self.program);
        }
    }
}
