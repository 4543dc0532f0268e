//! lancast: stream a running desktop to a single remote client.
//!
//! The pipeline stays on the GPU from capture to encode: the compositor
//! framebuffer is exported as dmabuf planes, color-converted to NV12 by a
//! pair of fragment shaders, and handed to the VA-API encoder whose coded
//! output goes straight onto the client TCP socket. Audio rides along as
//! raw PCM, and the client pushes synthetic HID reports back which are
//! injected through /dev/uhid.

pub mod audio;
pub mod buffer_queue;
pub mod capture;
pub mod encode;
pub mod gpu;
pub mod input;
pub mod perf;
pub mod proto;
pub mod reactor;
pub mod server;
