//! Framebuffer capture backends.
//!
//! Both backends speak the same protocol to the main loop: a pollable
//! fd, and a `process_events` that may yield one captured frame as an
//! owned dmabuf descriptor. The KMS backend ticks on a 1/60 s timer and
//! reads the CRTC's current framebuffer; the Wayland backend asks the
//! compositor through `zwlr_export_dmabuf_manager_v1`.
//!
//! A backend error is fatal to the *session* only; the orchestrator
//! drops the client and keeps accepting.

pub mod kms;
pub mod wlr;

use std::os::fd::RawFd;

use thiserror::Error;

use crate::gpu::FrameDescriptor;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no usable render node (tried every known module)")]
    NoDevice,
    #[error("nothing to capture: no CRTC has a framebuffer")]
    NoCrtc,
    #[error("drm: {0}")]
    Drm(String),
    #[error("wayland: {0}")]
    Wayland(String),
    #[error("required wayland globals are missing")]
    MissingGlobals,
    #[error("compositor cancelled the capture permanently")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait CaptureSource {
    /// Fd to watch for readability; readiness means `process_events`
    /// has work to do.
    fn events_fd(&self) -> RawFd;

    /// Dispatch pending backend events. Yields at most one captured
    /// frame whose dmabuf fds the caller now owns.
    fn process_events(&mut self) -> Result<Option<FrameDescriptor>, CaptureError>;
}

/// Pick a backend for the running environment: the compositor export
/// protocol when a Wayland session is visible, raw KMS otherwise.
pub fn create() -> Result<Box<dyn CaptureSource>, CaptureError> {
    if std::env::var_os("WAYLAND_DISPLAY").is_some() {
        tracing::info!("using wlroots export-dmabuf capture");
        Ok(Box::new(wlr::WlrCapture::new()?))
    } else {
        tracing::info!("using KMS framebuffer capture");
        Ok(Box::new(kms::KmsCapture::new()?))
    }
}
