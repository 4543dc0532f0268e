//! Wayland capture through `zwlr_export_dmabuf_manager_v1`.
//!
//! One capture request is in flight at a time. The compositor answers
//! with a `frame` event (geometry + format), one `object` event per
//! dmabuf plane, then `ready`, at which point the assembled descriptor
//! is handed to the main loop and the next request goes out. `cancel`
//! either re-arms (temporary, resizing) or kills the session
//! (permanent).

use std::os::fd::RawFd;

use wayland_client::globals::{registry_queue_init, GlobalListContents};
use wayland_client::protocol::{wl_output::WlOutput, wl_registry::WlRegistry};
use wayland_client::{Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum};
use wayland_protocols_wlr::export_dmabuf::v1::client::{
    zwlr_export_dmabuf_frame_v1::{self, CancelReason, ZwlrExportDmabufFrameV1},
    zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1,
};

use super::{CaptureError, CaptureSource};
use crate::gpu::{FrameDescriptor, PlaneDescriptor};

#[derive(Default)]
struct PendingFrame {
    width: u32,
    height: u32,
    fourcc: u32,
    modifier: u64,
    planes: Vec<Option<PlaneDescriptor>>,
}

struct State {
    output: WlOutput,
    manager: ZwlrExportDmabufManagerV1,
    pending: PendingFrame,
    ready: Option<FrameDescriptor>,
    cancelled: bool,
}

impl State {
    fn request_capture(&self, qh: &QueueHandle<State>) {
        // overlay_cursor = 1: the remote side has no local pointer.
        self.manager.capture_output(1, &self.output, qh, ());
    }
}

impl Dispatch<WlRegistry, GlobalListContents> for State {
    fn event(
        _state: &mut Self,
        _proxy: &WlRegistry,
        _event: <WlRegistry as Proxy>::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<WlOutput, ()> for State {
    fn event(
        _state: &mut Self,
        _proxy: &WlOutput,
        _event: <WlOutput as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // Geometry comes with the frame events; output chatter is noise.
    }
}

impl Dispatch<ZwlrExportDmabufManagerV1, ()> for State {
    fn event(
        _state: &mut Self,
        _proxy: &ZwlrExportDmabufManagerV1,
        _event: <ZwlrExportDmabufManagerV1 as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // The manager has no events.
    }
}

impl Dispatch<ZwlrExportDmabufFrameV1, ()> for State {
    fn event(
        state: &mut Self,
        proxy: &ZwlrExportDmabufFrameV1,
        event: <ZwlrExportDmabufFrameV1 as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_export_dmabuf_frame_v1::Event::Frame {
                width,
                height,
                format,
                mod_high,
                mod_low,
                num_objects,
                ..
            } => {
                state.pending = PendingFrame {
                    width,
                    height,
                    fourcc: format,
                    modifier: u64::from(mod_high) << 32 | u64::from(mod_low),
                    planes: Vec::new(),
                };
                state
                    .pending
                    .planes
                    .resize_with(num_objects as usize, || None);
            }
            zwlr_export_dmabuf_frame_v1::Event::Object {
                fd,
                offset,
                stride,
                plane_index,
                ..
            } => {
                let modifier = state.pending.modifier;
                if let Some(slot) = state.pending.planes.get_mut(plane_index as usize) {
                    *slot = Some(PlaneDescriptor {
                        fd,
                        offset,
                        pitch: stride,
                        modifier,
                    });
                }
            }
            zwlr_export_dmabuf_frame_v1::Event::Ready { .. } => {
                let pending = std::mem::take(&mut state.pending);
                let planes: Vec<PlaneDescriptor> =
                    pending.planes.into_iter().flatten().collect();
                if planes.is_empty() {
                    tracing::warn!("compositor sent a ready frame with no planes");
                } else {
                    if state.ready.is_some() {
                        tracing::warn!("dropping unconsumed captured frame");
                    }
                    state.ready = Some(FrameDescriptor {
                        width: pending.width,
                        height: pending.height,
                        fourcc: pending.fourcc,
                        planes,
                    });
                }
                proxy.destroy();
                state.request_capture(qh);
            }
            zwlr_export_dmabuf_frame_v1::Event::Cancel { reason } => {
                // Dropping the pending planes closes any received fds.
                state.pending = PendingFrame::default();
                proxy.destroy();
                match reason {
                    WEnum::Value(CancelReason::Permanent) => state.cancelled = true,
                    WEnum::Value(CancelReason::Temporary)
                    | WEnum::Value(CancelReason::Resizing) => state.request_capture(qh),
                    WEnum::Value(_) | WEnum::Unknown(_) => state.cancelled = true,
                }
            }
            _ => {}
        }
    }
}

pub struct WlrCapture {
    conn: Connection,
    queue: EventQueue<State>,
    state: State,
}

impl WlrCapture {
    pub fn new() -> Result<Self, CaptureError> {
        let conn = Connection::connect_to_env()
            .map_err(|err| CaptureError::Wayland(err.to_string()))?;
        let (globals, queue) = registry_queue_init::<State>(&conn)
            .map_err(|err| CaptureError::Wayland(err.to_string()))?;
        let qh = queue.handle();

        let output: WlOutput = globals
            .bind(&qh, 1..=WlOutput::interface().version, ())
            .map_err(|_| CaptureError::MissingGlobals)?;
        let manager: ZwlrExportDmabufManagerV1 = globals
            .bind(&qh, 1..=1, ())
            .map_err(|_| CaptureError::MissingGlobals)?;

        let state = State {
            output,
            manager,
            pending: PendingFrame::default(),
            ready: None,
            cancelled: false,
        };
        state.request_capture(&qh);
        conn.flush()
            .map_err(|err| CaptureError::Wayland(err.to_string()))?;

        Ok(Self { conn, queue, state })
    }
}

impl CaptureSource for WlrCapture {
    fn events_fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.conn.backend().poll_fd().as_raw_fd()
    }

    fn process_events(&mut self) -> Result<Option<FrameDescriptor>, CaptureError> {
        self.conn
            .flush()
            .map_err(|err| CaptureError::Wayland(err.to_string()))?;

        if let Some(guard) = self.queue.prepare_read() {
            match guard.read() {
                Ok(_) => {}
                Err(wayland_client::backend::WaylandError::Io(err))
                    if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(CaptureError::Wayland(err.to_string())),
            }
        }
        self.queue
            .dispatch_pending(&mut self.state)
            .map_err(|err| CaptureError::Wayland(err.to_string()))?;

        if self.state.cancelled {
            return Err(CaptureError::Cancelled);
        }
        Ok(self.state.ready.take())
    }
}
