//! GPU color conversion: RGB framebuffers in, NV12 encoder surfaces out.
//!
//! One process-wide headless GL ES 3.1 context runs two fragment
//! programs over a fullscreen quad: luma samples the source once and
//! writes an R8 target, chroma averages a 2x2 quad and writes a GR88
//! target at half resolution. Source and destination are both dmabuf
//! imports, so nothing is ever copied through system memory. All GL
//! calls stay on the thread that created the context.

pub mod egl;

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

use glow::HasContext;
use thiserror::Error;

use self::egl::{Egl, EglAttrib, EglDisplay, EglImage, PfnImageTargetTexture2D, EGL_NONE};

pub const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

pub const FOURCC_NV12: u32 = fourcc(b"NV12");
pub const FOURCC_R8: u32 = fourcc(b"R8  ");
pub const FOURCC_GR88: u32 = fourcc(b"GR88");

/// Render a fourcc readable for logs.
pub fn fourcc_str(code: u32) -> String {
    code.to_le_bytes()
        .iter()
        .map(|&byte| {
            if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '?'
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    Bt601,
    Bt709,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Range {
    Narrow,
    Full,
}

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("failed to load EGL: {0}")]
    Load(String),
    #[error("{op} failed ({detail})")]
    Egl { op: &'static str, detail: String },
    #[error("missing extension {0}")]
    MissingExtension(&'static str),
    #[error("shader build failed: {0}")]
    Shader(String),
    #[error("uniform {0} not found")]
    MissingUniform(&'static str),
    #[error("dmabuf format {0} unsupported by EGL")]
    UnsupportedFormat(String),
    #[error("modifier {modifier:#018x} for format {format} unsupported by EGL")]
    UnsupportedModifier { format: String, modifier: u64 },
    #[error("framebuffer incomplete ({0:#x})")]
    FramebufferIncomplete(u32),
    #[error("GL error {0:#x} during {1}")]
    Gl(u32, &'static str),
    #[error("image has {got} planes, expected at least {want}")]
    MissingPlanes { want: usize, got: usize },
}

/// One dmabuf plane. The fd is owned: it closes when the descriptor
/// (or the image that swallowed it) is dropped.
#[derive(Debug)]
pub struct PlaneDescriptor {
    pub fd: OwnedFd,
    pub offset: u32,
    pub pitch: u32,
    pub modifier: u64,
}

/// A captured or exported frame, described as dmabuf planes.
#[derive(Debug)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    pub planes: Vec<PlaneDescriptor>,
}

impl fmt::Display for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} ({} planes)",
            self.width,
            self.height,
            fourcc_str(self.fourcc),
            self.planes.len()
        )
    }
}

/// State shared between the context and the images it imported, so
/// teardown order comes out right whichever drops last.
struct GpuShared {
    egl: Egl,
    display: EglDisplay,
    context: egl::EglContext,
    gl: glow::Context,
    image_target_texture: PfnImageTargetTexture2D,
}

impl Drop for GpuShared {
    fn drop(&mut self) {
        let _ = self.egl.make_current(self.display, egl::EGL_NO_CONTEXT);
        self.egl.destroy_context(self.display, self.context);
        self.egl.terminate(self.display);
    }
}

/// A dmabuf imported for sampling or rendering: one EGL image plus one
/// texture per logical plane (NV12 splits into R8 + GR88).
pub struct GpuImage {
    shared: Rc<GpuShared>,
    width: u32,
    height: u32,
    images: Vec<EglImage>,
    textures: Vec<glow::NativeTexture>,
    _fds: Vec<OwnedFd>,
}

impl GpuImage {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        // Driver objects go in reverse creation order; the fds close on
        // their own afterwards.
        for texture in self.textures.drain(..).rev() {
            unsafe { self.shared.gl.delete_texture(texture) };
        }
        for image in self.images.drain(..).rev() {
            self.shared.egl.destroy_image(self.shared.display, image);
        }
    }
}

pub struct GpuContext {
    shared: Rc<GpuShared>,
    program_luma: glow::NativeProgram,
    program_chroma: glow::NativeProgram,
    sample_offsets: glow::NativeUniformLocation,
    framebuffer: glow::NativeFramebuffer,
    vertices: glow::NativeBuffer,
    vertex_array: glow::NativeVertexArray,
}

const COLORSPACE_BT601: [f32; 9] = [
    0.299, 0.587, 0.114, //
    -0.168_736, -0.331_264, 0.5, //
    0.5, -0.418_688, -0.081_312,
];
const COLORSPACE_BT709: [f32; 9] = [
    0.2126, 0.7152, 0.0722, //
    -0.1146, -0.3854, 0.5, //
    0.5, -0.4542, -0.0458,
];

// Offset and scale per YUV component, applied after the matrix.
const RANGE_NARROW: [f32; 6] = [
    16.0 / 255.0,
    16.0 / 255.0,
    16.0 / 255.0,
    (235.0 - 16.0) / 255.0,
    (240.0 - 16.0) / 255.0,
    (240.0 - 16.0) / 255.0,
];
const RANGE_FULL: [f32; 6] = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0];

fn has_extension(haystack: &str, needle: &'static str) -> Result<(), GpuError> {
    if haystack.split_ascii_whitespace().any(|ext| ext == needle) {
        Ok(())
    } else {
        Err(GpuError::MissingExtension(needle))
    }
}

impl GpuContext {
    /// Create the process-wide headless context and build both shader
    /// programs. Colorspace and range are fixed for the process; the
    /// shaders themselves are colorspace-agnostic.
    pub fn new(colorspace: Colorspace, range: Range) -> Result<Self, GpuError> {
        let egl = Egl::load()?;
        let display = egl.surfaceless_display()?;
        let (major, minor) = egl.initialize(display)?;
        tracing::info!("initialized EGL {major}.{minor}");

        let extensions = egl.extensions(display)?;
        tracing::debug!("EGL extensions: {extensions}");
        has_extension(&extensions, "EGL_KHR_surfaceless_context")?;
        has_extension(&extensions, "EGL_EXT_image_dma_buf_import")?;
        has_extension(&extensions, "EGL_EXT_image_dma_buf_import_modifiers")?;

        egl.bind_gles_api()?;
        let config = egl.choose_gles3_config(display)?;
        let context = egl.create_gles31_context(display, config)?;
        egl.make_current(display, context)?;

        let gl = unsafe {
            glow::Context::from_loader_function(|name| egl.get_proc_address(name) as *const _)
        };
        let image_target_texture = egl.image_target_texture()?;

        let matrix = match colorspace {
            Colorspace::Bt601 => COLORSPACE_BT601,
            Colorspace::Bt709 => COLORSPACE_BT709,
        };
        let ranges = match range {
            Range::Narrow => RANGE_NARROW,
            Range::Full => RANGE_FULL,
        };

        let vertex_src = include_str!("vertex.glsl");
        let program_luma =
            build_program(&gl, vertex_src, include_str!("luma.glsl"), &matrix, &ranges)?;
        let program_chroma =
            build_program(&gl, vertex_src, include_str!("chroma.glsl"), &matrix, &ranges)?;
        let sample_offsets = unsafe { gl.get_uniform_location(program_chroma, "sample_offsets") }
            .ok_or(GpuError::MissingUniform("sample_offsets"))?;

        let (framebuffer, vertices, vertex_array) = unsafe {
            let vertex_array = gl.create_vertex_array().map_err(GpuError::Shader)?;
            gl.bind_vertex_array(Some(vertex_array));
            let framebuffer = gl.create_framebuffer().map_err(GpuError::Shader)?;
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            let vertices = gl.create_buffer().map_err(GpuError::Shader)?;
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vertices));
            let quad: [f32; 8] = [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
            let bytes: Vec<u8> = quad.iter().flat_map(|v| v.to_ne_bytes()).collect();
            gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, &bytes, glow::STATIC_DRAW);
            gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, 0, 0);
            gl.enable_vertex_attrib_array(0);
            gl.active_texture(glow::TEXTURE0);
            check_gl(&gl, "static object setup")?;
            (framebuffer, vertices, vertex_array)
        };

        Ok(Self {
            shared: Rc::new(GpuShared {
                egl,
                display,
                context,
                gl,
                image_target_texture,
            }),
            program_luma,
            program_chroma,
            sample_offsets,
            framebuffer,
            vertices,
            vertex_array,
        })
    }

    /// Import a dmabuf frame, taking ownership of its fds. NV12 is
    /// imported twice (R8 luma, GR88 chroma at half size); anything else
    /// becomes a single multiplanar image.
    pub fn import_frame(&self, desc: FrameDescriptor) -> Result<GpuImage, GpuError> {
        let shared = &self.shared;
        self.check_import_supported(&desc)?;

        let mut images = Vec::new();
        let mut textures = Vec::new();
        let result = (|| {
            if desc.fourcc == FOURCC_NV12 {
                if desc.planes.len() < 2 {
                    return Err(GpuError::MissingPlanes {
                        want: 2,
                        got: desc.planes.len(),
                    });
                }
                images.push(shared.egl.create_dmabuf_image(
                    shared.display,
                    &image_attribs(desc.width, desc.height, FOURCC_R8, &desc.planes[..1]),
                )?);
                images.push(shared.egl.create_dmabuf_image(
                    shared.display,
                    &image_attribs(
                        desc.width / 2,
                        desc.height / 2,
                        FOURCC_GR88,
                        &desc.planes[1..2],
                    ),
                )?);
            } else {
                images.push(shared.egl.create_dmabuf_image(
                    shared.display,
                    &image_attribs(desc.width, desc.height, desc.fourcc, &desc.planes),
                )?);
            }

            for &image in &images {
                textures.push(self.create_texture(image)?);
            }
            Ok(())
        })();

        if let Err(err) = result {
            for texture in textures.drain(..).rev() {
                unsafe { shared.gl.delete_texture(texture) };
            }
            for image in images.drain(..).rev() {
                shared.egl.destroy_image(shared.display, image);
            }
            return Err(err);
        }

        Ok(GpuImage {
            shared: shared.clone(),
            width: desc.width,
            height: desc.height,
            images,
            textures,
            _fds: desc.planes.into_iter().map(|plane| plane.fd).collect(),
        })
    }

    /// Render `from` into `to` (luma pass, then 2x2-averaged chroma
    /// pass) and wait for the GPU to finish so the encoder observes the
    /// completed write.
    pub fn convert(&self, from: &GpuImage, to: &GpuImage) -> Result<(), GpuError> {
        let gl = &self.shared.gl;
        if to.textures.len() < 2 {
            return Err(GpuError::MissingPlanes {
                want: 2,
                got: to.textures.len(),
            });
        }

        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(self.framebuffer));

            gl.use_program(Some(self.program_luma));
            gl.viewport(0, 0, to.width as i32, to.height as i32);
            self.draw_plane(from.textures[0], to.textures[0])?;

            let offsets: [f32; 8] = [
                0.0,
                0.0,
                1.0 / from.width as f32,
                0.0,
                0.0,
                1.0 / from.height as f32,
                1.0 / from.width as f32,
                1.0 / from.height as f32,
            ];
            gl.use_program(Some(self.program_chroma));
            gl.uniform_2_f32_slice(Some(&self.sample_offsets), &offsets);
            gl.viewport(0, 0, (to.width / 2) as i32, (to.height / 2) as i32);
            self.draw_plane(from.textures[0], to.textures[1])?;
        }

        self.sync()
    }

    fn draw_plane(
        &self,
        from: glow::NativeTexture,
        to: glow::NativeTexture,
    ) -> Result<(), GpuError> {
        let gl = &self.shared.gl;
        unsafe {
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(to),
                0,
            );
            let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
            if status != glow::FRAMEBUFFER_COMPLETE {
                return Err(GpuError::FramebufferIncomplete(status));
            }
            gl.bind_texture(glow::TEXTURE_2D, Some(from));
            gl.draw_arrays(glow::TRIANGLE_FAN, 0, 4);
            check_gl(gl, "plane draw")?;
        }
        Ok(())
    }

    /// Insert a fence and wait on it. Single-digit milliseconds in the
    /// common case; the loop guards against spurious timeouts.
    fn sync(&self) -> Result<(), GpuError> {
        let gl = &self.shared.gl;
        unsafe {
            let fence = match gl.fence_sync(glow::SYNC_GPU_COMMANDS_COMPLETE, 0) {
                Ok(fence) => fence,
                Err(_) => return Err(GpuError::Gl(gl.get_error(), "fence creation")),
            };
            let mut flags = glow::SYNC_FLUSH_COMMANDS_BIT;
            loop {
                match gl.client_wait_sync(fence, flags, 1_000_000_000) {
                    glow::ALREADY_SIGNALED | glow::CONDITION_SATISFIED => break,
                    glow::TIMEOUT_EXPIRED => {
                        flags = 0;
                        continue;
                    }
                    _ => {
                        gl.delete_sync(fence);
                        return Err(GpuError::Gl(gl.get_error(), "fence wait"));
                    }
                }
            }
            gl.delete_sync(fence);
        }
        Ok(())
    }

    fn create_texture(&self, image: EglImage) -> Result<glow::NativeTexture, GpuError> {
        let gl = &self.shared.gl;
        unsafe {
            let texture = gl.create_texture().map_err(GpuError::Shader)?;
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_MAG_FILTER,
                glow::NEAREST as i32,
            );
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_MIN_FILTER,
                glow::NEAREST as i32,
            );
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_WRAP_S,
                glow::CLAMP_TO_EDGE as i32,
            );
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_WRAP_T,
                glow::CLAMP_TO_EDGE as i32,
            );
            (self.shared.image_target_texture)(glow::TEXTURE_2D, image);
            if let Err(err) = check_gl(gl, "EGL image binding") {
                gl.delete_texture(texture);
                return Err(err);
            }
            Ok(texture)
        }
    }

    fn check_import_supported(&self, desc: &FrameDescriptor) -> Result<(), GpuError> {
        let shared = &self.shared;
        // NV12 goes in as R8 + GR88 sub-images, so those are the
        // formats EGL has to accept.
        let formats: &[u32] = if desc.fourcc == FOURCC_NV12 {
            &[FOURCC_R8, FOURCC_GR88]
        } else {
            std::slice::from_ref(&desc.fourcc)
        };
        let supported = shared.egl.dmabuf_formats(shared.display)?;
        for &format in formats {
            if !supported.contains(&format) {
                tracing::warn!(
                    "format {} unsupported; EGL supports: {}",
                    fourcc_str(format),
                    supported
                        .iter()
                        .map(|&f| fourcc_str(f))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                return Err(GpuError::UnsupportedFormat(fourcc_str(format)));
            }
            let modifiers = shared.egl.dmabuf_modifiers(shared.display, format)?;
            for plane in &desc.planes {
                if !modifiers.contains(&plane.modifier) {
                    return Err(GpuError::UnsupportedModifier {
                        format: fourcc_str(format),
                        modifier: plane.modifier,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        let gl = &self.shared.gl;
        unsafe {
            gl.delete_buffer(self.vertices);
            gl.delete_vertex_array(self.vertex_array);
            gl.delete_framebuffer(self.framebuffer);
            gl.delete_program(self.program_chroma);
            gl.delete_program(self.program_luma);
        }
        // GpuShared tears down the EGL context once the last image went.
    }
}

fn check_gl(gl: &glow::Context, what: &'static str) -> Result<(), GpuError> {
    let error = unsafe { gl.get_error() };
    if error != glow::NO_ERROR {
        return Err(GpuError::Gl(error, what));
    }
    Ok(())
}

fn build_program(
    gl: &glow::Context,
    vertex_src: &str,
    fragment_src: &str,
    matrix: &[f32; 9],
    ranges: &[f32; 6],
) -> Result<glow::NativeProgram, GpuError> {
    let compile = |kind: u32, src: &str| -> Result<glow::NativeShader, GpuError> {
        unsafe {
            let shader = gl.create_shader(kind).map_err(GpuError::Shader)?;
            gl.shader_source(shader, src);
            gl.compile_shader(shader);
            if !gl.get_shader_compile_status(shader) {
                let log = gl.get_shader_info_log(shader);
                gl.delete_shader(shader);
                return Err(GpuError::Shader(log));
            }
            Ok(shader)
        }
    };

    unsafe {
        let vertex = compile(glow::VERTEX_SHADER, vertex_src)?;
        let fragment = match compile(glow::FRAGMENT_SHADER, fragment_src) {
            Ok(shader) => shader,
            Err(err) => {
                gl.delete_shader(vertex);
                return Err(err);
            }
        };

        let program = gl.create_program().map_err(GpuError::Shader)?;
        gl.attach_shader(program, vertex);
        gl.attach_shader(program, fragment);
        gl.link_program(program);
        let linked = gl.get_program_link_status(program);
        let log = gl.get_program_info_log(program);
        gl.delete_shader(fragment);
        gl.delete_shader(vertex);
        if !linked {
            gl.delete_program(program);
            return Err(GpuError::Shader(log));
        }

        // Common uniforms are fixed for the lifetime of the program.
        gl.use_program(Some(program));
        let img_input = gl
            .get_uniform_location(program, "img_input")
            .ok_or(GpuError::MissingUniform("img_input"))?;
        let colorspace = gl
            .get_uniform_location(program, "colorspace")
            .ok_or(GpuError::MissingUniform("colorspace"))?;
        let ranges_loc = gl
            .get_uniform_location(program, "ranges")
            .ok_or(GpuError::MissingUniform("ranges"))?;
        gl.uniform_1_i32(Some(&img_input), 0);
        gl.uniform_matrix_3_f32_slice(Some(&colorspace), true, matrix);
        gl.uniform_3_f32_slice(Some(&ranges_loc), ranges);
        check_gl(gl, "uniform setup")?;
        Ok(program)
    }
}

fn image_attribs(
    width: u32,
    height: u32,
    format: u32,
    planes: &[PlaneDescriptor],
) -> Vec<EglAttrib> {
    const PLANE_KEYS: [[EglAttrib; 5]; 4] = [
        [
            egl::EGL_DMA_BUF_PLANE0_FD_EXT,
            egl::EGL_DMA_BUF_PLANE0_OFFSET_EXT,
            egl::EGL_DMA_BUF_PLANE0_PITCH_EXT,
            egl::EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT,
            egl::EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT,
        ],
        [
            egl::EGL_DMA_BUF_PLANE1_FD_EXT,
            egl::EGL_DMA_BUF_PLANE1_OFFSET_EXT,
            egl::EGL_DMA_BUF_PLANE1_PITCH_EXT,
            egl::EGL_DMA_BUF_PLANE1_MODIFIER_LO_EXT,
            egl::EGL_DMA_BUF_PLANE1_MODIFIER_HI_EXT,
        ],
        [
            egl::EGL_DMA_BUF_PLANE2_FD_EXT,
            egl::EGL_DMA_BUF_PLANE2_OFFSET_EXT,
            egl::EGL_DMA_BUF_PLANE2_PITCH_EXT,
            egl::EGL_DMA_BUF_PLANE2_MODIFIER_LO_EXT,
            egl::EGL_DMA_BUF_PLANE2_MODIFIER_HI_EXT,
        ],
        [
            egl::EGL_DMA_BUF_PLANE3_FD_EXT,
            egl::EGL_DMA_BUF_PLANE3_OFFSET_EXT,
            egl::EGL_DMA_BUF_PLANE3_PITCH_EXT,
            egl::EGL_DMA_BUF_PLANE3_MODIFIER_LO_EXT,
            egl::EGL_DMA_BUF_PLANE3_MODIFIER_HI_EXT,
        ],
    ];

    let mut attribs = vec![
        egl::EGL_WIDTH,
        width as EglAttrib,
        egl::EGL_HEIGHT,
        height as EglAttrib,
        egl::EGL_LINUX_DRM_FOURCC_EXT,
        format as EglAttrib,
    ];
    for (plane, keys) in planes.iter().zip(PLANE_KEYS.iter()) {
        attribs.extend_from_slice(&[
            keys[0],
            plane.fd.as_raw_fd() as EglAttrib,
            keys[1],
            plane.offset as EglAttrib,
            keys[2],
            plane.pitch as EglAttrib,
            keys[3],
            (plane.modifier & u64::from(u32::MAX)) as EglAttrib,
            keys[4],
            (plane.modifier >> 32) as EglAttrib,
        ]);
    }
    attribs.push(EGL_NONE);
    attribs
}
