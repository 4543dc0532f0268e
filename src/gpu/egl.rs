//! Minimal headless-EGL binding, loaded from `libEGL.so.1` at runtime.
//!
//! Only the entry points the conversion pipeline touches are declared:
//! surfaceless display/context setup, dmabuf image import and the
//! format/modifier queries. GL itself goes through `glow`, fed from
//! `eglGetProcAddress`.

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;

use super::GpuError;

pub type EglDisplay = *mut c_void;
pub type EglConfig = *mut c_void;
pub type EglContext = *mut c_void;
pub type EglImage = *mut c_void;
pub type EglBoolean = u32;
pub type EglInt = i32;
pub type EglAttrib = isize;
pub type EglEnum = u32;

pub const EGL_FALSE: EglBoolean = 0;
pub const EGL_NO_DISPLAY: EglDisplay = ptr::null_mut();
pub const EGL_NO_CONTEXT: EglContext = ptr::null_mut();
pub const EGL_NO_IMAGE: EglImage = ptr::null_mut();

pub const EGL_SUCCESS: EglInt = 0x3000;
pub const EGL_CONTEXT_LOST: EglInt = 0x300E;
pub const EGL_NONE: EglAttrib = 0x3038;
pub const EGL_EXTENSIONS: EglInt = 0x3055;
pub const EGL_WIDTH: EglAttrib = 0x3057;
pub const EGL_HEIGHT: EglAttrib = 0x3056;
pub const EGL_SURFACE_TYPE: EglInt = 0x3033;
pub const EGL_RENDERABLE_TYPE: EglInt = 0x3040;
pub const EGL_OPENGL_ES3_BIT: EglInt = 0x0040;
pub const EGL_OPENGL_ES_API: EglEnum = 0x30A0;
pub const EGL_CONTEXT_MAJOR_VERSION: EglInt = 0x3098;
pub const EGL_CONTEXT_MINOR_VERSION: EglInt = 0x30FB;

pub const EGL_PLATFORM_SURFACELESS_MESA: EglEnum = 0x31DD;

pub const EGL_LINUX_DMA_BUF_EXT: EglEnum = 0x3270;
pub const EGL_LINUX_DRM_FOURCC_EXT: EglAttrib = 0x3271;
pub const EGL_DMA_BUF_PLANE0_FD_EXT: EglAttrib = 0x3272;
pub const EGL_DMA_BUF_PLANE0_OFFSET_EXT: EglAttrib = 0x3273;
pub const EGL_DMA_BUF_PLANE0_PITCH_EXT: EglAttrib = 0x3274;
pub const EGL_DMA_BUF_PLANE1_FD_EXT: EglAttrib = 0x3275;
pub const EGL_DMA_BUF_PLANE1_OFFSET_EXT: EglAttrib = 0x3276;
pub const EGL_DMA_BUF_PLANE1_PITCH_EXT: EglAttrib = 0x3277;
pub const EGL_DMA_BUF_PLANE2_FD_EXT: EglAttrib = 0x3278;
pub const EGL_DMA_BUF_PLANE2_OFFSET_EXT: EglAttrib = 0x3279;
pub const EGL_DMA_BUF_PLANE2_PITCH_EXT: EglAttrib = 0x327A;
pub const EGL_DMA_BUF_PLANE3_FD_EXT: EglAttrib = 0x3440;
pub const EGL_DMA_BUF_PLANE3_OFFSET_EXT: EglAttrib = 0x3441;
pub const EGL_DMA_BUF_PLANE3_PITCH_EXT: EglAttrib = 0x3442;
pub const EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT: EglAttrib = 0x3443;
pub const EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT: EglAttrib = 0x3444;
pub const EGL_DMA_BUF_PLANE1_MODIFIER_LO_EXT: EglAttrib = 0x3445;
pub const EGL_DMA_BUF_PLANE1_MODIFIER_HI_EXT: EglAttrib = 0x3446;
pub const EGL_DMA_BUF_PLANE2_MODIFIER_LO_EXT: EglAttrib = 0x3447;
pub const EGL_DMA_BUF_PLANE2_MODIFIER_HI_EXT: EglAttrib = 0x3448;
pub const EGL_DMA_BUF_PLANE3_MODIFIER_LO_EXT: EglAttrib = 0x3449;
pub const EGL_DMA_BUF_PLANE3_MODIFIER_HI_EXT: EglAttrib = 0x344A;

type PfnGetProcAddress = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type PfnGetPlatformDisplay =
    unsafe extern "C" fn(EglEnum, *mut c_void, *const EglAttrib) -> EglDisplay;
type PfnInitialize = unsafe extern "C" fn(EglDisplay, *mut EglInt, *mut EglInt) -> EglBoolean;
type PfnTerminate = unsafe extern "C" fn(EglDisplay) -> EglBoolean;
type PfnQueryString = unsafe extern "C" fn(EglDisplay, EglInt) -> *const c_char;
type PfnBindApi = unsafe extern "C" fn(EglEnum) -> EglBoolean;
type PfnChooseConfig = unsafe extern "C" fn(
    EglDisplay,
    *const EglInt,
    *mut EglConfig,
    EglInt,
    *mut EglInt,
) -> EglBoolean;
type PfnCreateContext =
    unsafe extern "C" fn(EglDisplay, EglConfig, EglContext, *const EglInt) -> EglContext;
type PfnDestroyContext = unsafe extern "C" fn(EglDisplay, EglContext) -> EglBoolean;
type PfnMakeCurrent =
    unsafe extern "C" fn(EglDisplay, *mut c_void, *mut c_void, EglContext) -> EglBoolean;
type PfnGetError = unsafe extern "C" fn() -> EglInt;
type PfnCreateImage = unsafe extern "C" fn(
    EglDisplay,
    EglContext,
    EglEnum,
    *mut c_void,
    *const EglAttrib,
) -> EglImage;
type PfnDestroyImage = unsafe extern "C" fn(EglDisplay, EglImage) -> EglBoolean;
type PfnQueryDmaBufFormats =
    unsafe extern "C" fn(EglDisplay, EglInt, *mut EglInt, *mut EglInt) -> EglBoolean;
type PfnQueryDmaBufModifiers = unsafe extern "C" fn(
    EglDisplay,
    EglInt,
    EglInt,
    *mut u64,
    *mut EglBoolean,
    *mut EglInt,
) -> EglBoolean;
pub type PfnImageTargetTexture2D = unsafe extern "C" fn(u32, *mut c_void);

fn egl_error_string(error: EglInt) -> &'static str {
    const NAMES: [&str; 15] = [
        "EGL_SUCCESS",
        "EGL_NOT_INITIALIZED",
        "EGL_BAD_ACCESS",
        "EGL_BAD_ALLOC",
        "EGL_BAD_ATTRIBUTE",
        "EGL_BAD_CONFIG",
        "EGL_BAD_CONTEXT",
        "EGL_BAD_CURRENT_SURFACE",
        "EGL_BAD_DISPLAY",
        "EGL_BAD_MATCH",
        "EGL_BAD_NATIVE_PIXMAP",
        "EGL_BAD_NATIVE_WINDOW",
        "EGL_BAD_PARAMETER",
        "EGL_BAD_SURFACE",
        "EGL_CONTEXT_LOST",
    ];
    if (EGL_SUCCESS..=EGL_CONTEXT_LOST).contains(&error) {
        NAMES[(error - EGL_SUCCESS) as usize]
    } else {
        "???"
    }
}

/// Loaded libEGL with the entry points resolved to plain fn pointers.
pub struct Egl {
    _lib: libloading::Library,
    get_proc_address: PfnGetProcAddress,
    get_platform_display: PfnGetPlatformDisplay,
    initialize: PfnInitialize,
    terminate: PfnTerminate,
    query_string: PfnQueryString,
    bind_api: PfnBindApi,
    choose_config: PfnChooseConfig,
    create_context: PfnCreateContext,
    destroy_context: PfnDestroyContext,
    make_current: PfnMakeCurrent,
    get_error: PfnGetError,
    create_image: PfnCreateImage,
    destroy_image: PfnDestroyImage,
    query_dmabuf_formats: PfnQueryDmaBufFormats,
    query_dmabuf_modifiers: PfnQueryDmaBufModifiers,
}

macro_rules! load_symbol {
    ($lib:expr, $name:literal) => {
        *$lib
            .get($name)
            .map_err(|err| GpuError::Load(format!("{}: {err}", String::from_utf8_lossy($name))))?
    };
}

impl Egl {
    pub fn load() -> Result<Self, GpuError> {
        // Safety: libEGL registers no problematic constructors.
        let lib = unsafe { libloading::Library::new("libEGL.so.1") }
            .map_err(|err| GpuError::Load(format!("libEGL.so.1: {err}")))?;
        unsafe {
            Ok(Self {
                get_proc_address: load_symbol!(lib, b"eglGetProcAddress\0"),
                get_platform_display: load_symbol!(lib, b"eglGetPlatformDisplay\0"),
                initialize: load_symbol!(lib, b"eglInitialize\0"),
                terminate: load_symbol!(lib, b"eglTerminate\0"),
                query_string: load_symbol!(lib, b"eglQueryString\0"),
                bind_api: load_symbol!(lib, b"eglBindAPI\0"),
                choose_config: load_symbol!(lib, b"eglChooseConfig\0"),
                create_context: load_symbol!(lib, b"eglCreateContext\0"),
                destroy_context: load_symbol!(lib, b"eglDestroyContext\0"),
                make_current: load_symbol!(lib, b"eglMakeCurrent\0"),
                get_error: load_symbol!(lib, b"eglGetError\0"),
                create_image: load_symbol!(lib, b"eglCreateImage\0"),
                destroy_image: load_symbol!(lib, b"eglDestroyImage\0"),
                query_dmabuf_formats: load_symbol!(lib, b"eglQueryDmaBufFormatsEXT\0"),
                query_dmabuf_modifiers: load_symbol!(lib, b"eglQueryDmaBufModifiersEXT\0"),
                _lib: lib,
            })
        }
    }

    fn error(&self, op: &'static str) -> GpuError {
        let code = unsafe { (self.get_error)() };
        GpuError::Egl {
            op,
            detail: egl_error_string(code).to_owned(),
        }
    }

    pub fn get_proc_address(&self, name: &str) -> *mut c_void {
        let name = CString::new(name).expect("GL symbol names have no NUL");
        unsafe { (self.get_proc_address)(name.as_ptr()) }
    }

    pub fn surfaceless_display(&self) -> Result<EglDisplay, GpuError> {
        let display = unsafe {
            (self.get_platform_display)(EGL_PLATFORM_SURFACELESS_MESA, ptr::null_mut(), ptr::null())
        };
        if display == EGL_NO_DISPLAY {
            return Err(self.error("eglGetPlatformDisplay"));
        }
        Ok(display)
    }

    pub fn initialize(&self, display: EglDisplay) -> Result<(EglInt, EglInt), GpuError> {
        let (mut major, mut minor) = (0, 0);
        if unsafe { (self.initialize)(display, &mut major, &mut minor) } == EGL_FALSE {
            return Err(self.error("eglInitialize"));
        }
        Ok((major, minor))
    }

    pub fn terminate(&self, display: EglDisplay) {
        unsafe { (self.terminate)(display) };
    }

    pub fn extensions(&self, display: EglDisplay) -> Result<String, GpuError> {
        let raw = unsafe { (self.query_string)(display, EGL_EXTENSIONS) };
        if raw.is_null() {
            return Err(self.error("eglQueryString"));
        }
        Ok(unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned())
    }

    pub fn bind_gles_api(&self) -> Result<(), GpuError> {
        if unsafe { (self.bind_api)(EGL_OPENGL_ES_API) } == EGL_FALSE {
            return Err(self.error("eglBindAPI"));
        }
        Ok(())
    }

    pub fn choose_gles3_config(&self, display: EglDisplay) -> Result<EglConfig, GpuError> {
        // Surfaceless rendering into dmabuf-backed FBOs: no surface bits.
        let attribs = [
            EGL_RENDERABLE_TYPE,
            EGL_OPENGL_ES3_BIT,
            EGL_SURFACE_TYPE,
            0,
            EGL_NONE as EglInt,
        ];
        let mut config: EglConfig = ptr::null_mut();
        let mut count = 0;
        let ok = unsafe {
            (self.choose_config)(display, attribs.as_ptr(), &mut config, 1, &mut count)
        };
        if ok == EGL_FALSE || count < 1 {
            return Err(self.error("eglChooseConfig"));
        }
        Ok(config)
    }

    pub fn create_gles31_context(
        &self,
        display: EglDisplay,
        config: EglConfig,
    ) -> Result<EglContext, GpuError> {
        let attribs = [
            EGL_CONTEXT_MAJOR_VERSION,
            3,
            EGL_CONTEXT_MINOR_VERSION,
            1,
            EGL_NONE as EglInt,
        ];
        let context =
            unsafe { (self.create_context)(display, config, EGL_NO_CONTEXT, attribs.as_ptr()) };
        if context == EGL_NO_CONTEXT {
            return Err(self.error("eglCreateContext"));
        }
        Ok(context)
    }

    pub fn destroy_context(&self, display: EglDisplay, context: EglContext) {
        unsafe { (self.destroy_context)(display, context) };
    }

    pub fn make_current(
        &self,
        display: EglDisplay,
        context: EglContext,
    ) -> Result<(), GpuError> {
        let ok =
            unsafe { (self.make_current)(display, ptr::null_mut(), ptr::null_mut(), context) };
        if ok == EGL_FALSE {
            return Err(self.error("eglMakeCurrent"));
        }
        Ok(())
    }

    pub fn create_dmabuf_image(
        &self,
        display: EglDisplay,
        attribs: &[EglAttrib],
    ) -> Result<EglImage, GpuError> {
        debug_assert_eq!(attribs.last(), Some(&EGL_NONE));
        let image = unsafe {
            (self.create_image)(
                display,
                EGL_NO_CONTEXT,
                EGL_LINUX_DMA_BUF_EXT,
                ptr::null_mut(),
                attribs.as_ptr(),
            )
        };
        if image == EGL_NO_IMAGE {
            return Err(self.error("eglCreateImage"));
        }
        Ok(image)
    }

    pub fn destroy_image(&self, display: EglDisplay, image: EglImage) {
        unsafe { (self.destroy_image)(display, image) };
    }

    pub fn dmabuf_formats(&self, display: EglDisplay) -> Result<Vec<u32>, GpuError> {
        let mut count = 0;
        if unsafe { (self.query_dmabuf_formats)(display, 0, ptr::null_mut(), &mut count) }
            == EGL_FALSE
        {
            return Err(self.error("eglQueryDmaBufFormatsEXT"));
        }
        let mut formats = vec![0 as EglInt; count.max(0) as usize];
        let ok = unsafe {
            (self.query_dmabuf_formats)(display, count, formats.as_mut_ptr(), &mut count)
        };
        if ok == EGL_FALSE {
            return Err(self.error("eglQueryDmaBufFormatsEXT"));
        }
        formats.truncate(count.max(0) as usize);
        Ok(formats.into_iter().map(|format| format as u32).collect())
    }

    /// Modifiers usable for render targets (external-only ones excluded).
    pub fn dmabuf_modifiers(
        &self,
        display: EglDisplay,
        fourcc: u32,
    ) -> Result<Vec<u64>, GpuError> {
        let mut count = 0;
        let ok = unsafe {
            (self.query_dmabuf_modifiers)(
                display,
                fourcc as EglInt,
                0,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut count,
            )
        };
        if ok == EGL_FALSE {
            return Err(self.error("eglQueryDmaBufModifiersEXT"));
        }
        let len = count.max(0) as usize;
        let mut modifiers = vec![0u64; len];
        let mut external_only = vec![0 as EglBoolean; len];
        let ok = unsafe {
            (self.query_dmabuf_modifiers)(
                display,
                fourcc as EglInt,
                count,
                modifiers.as_mut_ptr(),
                external_only.as_mut_ptr(),
                &mut count,
            )
        };
        if ok == EGL_FALSE {
            return Err(self.error("eglQueryDmaBufModifiersEXT"));
        }
        Ok(modifiers
            .into_iter()
            .zip(external_only)
            .filter(|&(_, external)| external == EGL_FALSE)
            .map(|(modifier, _)| modifier)
            .collect())
    }

    /// `glEGLImageTargetTexture2DOES`, required by GL_OES_EGL_image.
    pub fn image_target_texture(&self) -> Result<PfnImageTargetTexture2D, GpuError> {
        let ptr = self.get_proc_address("glEGLImageTargetTexture2DOES");
        if ptr.is_null() {
            return Err(GpuError::MissingExtension("GL_OES_EGL_image"));
        }
        // Safety: the proc address has exactly this prototype.
        Ok(unsafe { std::mem::transmute::<*mut c_void, PfnImageTargetTexture2D>(ptr) })
    }
}
