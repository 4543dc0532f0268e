//! KMS capture: read the scanout framebuffer straight off the CRTC.
//!
//! No compositor cooperation needed; the card node is scanned for a
//! CRTC whose current framebuffer has buffer handles, and a monotonic
//! timer paces capture at 60 Hz. Each tick re-queries the CRTC (the
//! framebuffer flips every frame) and exports the buffer handles as
//! PRIME fds.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use drm::control::{crtc, Device as ControlDevice};
use drm::Device;

use super::{CaptureError, CaptureSource};
use crate::gpu::{FrameDescriptor, PlaneDescriptor};

/// 60 Hz capture cadence.
const CAPTURE_PERIOD_NS: u64 = 1_000_000_000 / 60;

/// Kernel modules worth scanning for, in preference order.
const KNOWN_MODULES: [&str; 29] = [
    "i915",
    "amdgpu",
    "radeon",
    "nouveau",
    "vmwgfx",
    "omapdrm",
    "exynos",
    "tilcdc",
    "msm",
    "sti",
    "tegra",
    "imx-drm",
    "rockchip",
    "atmel-hlcdc",
    "fsl-dcu-drm",
    "vc4",
    "virtio_gpu",
    "mediatek",
    "meson",
    "pl111",
    "stm",
    "sun4i-drm",
    "armada-drm",
    "komeda",
    "imx-dcss",
    "mxsfb-drm",
    "simpledrm",
    "imx-lcdif",
    "vkms",
];

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

fn open_any_module() -> Result<Card, CaptureError> {
    for index in 0..16 {
        let path = format!("/dev/dri/card{index}");
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) => {
                tracing::debug!("skipping {path}: {err}");
                continue;
            }
        };
        let card = Card(file);
        match card.get_driver() {
            Ok(driver) => {
                let name = driver.name().to_string_lossy().into_owned();
                if KNOWN_MODULES.contains(&name.as_str()) {
                    tracing::info!("capturing through {path} ({name})");
                    return Ok(card);
                }
                tracing::debug!("skipping {path}: unknown driver {name}");
            }
            Err(err) => tracing::debug!("skipping {path}: {err}"),
        }
    }
    Err(CaptureError::NoDevice)
}

pub struct KmsCapture {
    card: Card,
    crtc: crtc::Handle,
    timer: OwnedFd,
}

impl KmsCapture {
    pub fn new() -> Result<Self, CaptureError> {
        let card = open_any_module()?;

        let resources = card.resource_handles().map_err(std::io::Error::from)?;
        let crtc = resources
            .crtcs()
            .iter()
            .copied()
            .find(|&handle| Self::crtc_has_framebuffer(&card, handle))
            .ok_or(CaptureError::NoCrtc)?;
        tracing::info!("capturing crtc {crtc:?}");

        let timer = rustix::time::timerfd_create(
            rustix::time::TimerfdClockId::Monotonic,
            rustix::time::TimerfdFlags::empty(),
        )
        .map_err(std::io::Error::from)?;
        let period = rustix::time::Timespec {
            tv_sec: 0,
            tv_nsec: CAPTURE_PERIOD_NS as i64,
        };
        rustix::time::timerfd_settime(
            &timer,
            rustix::time::TimerfdTimerFlags::empty(),
            &rustix::time::Itimerspec {
                it_interval: period,
                it_value: period,
            },
        )
        .map_err(std::io::Error::from)?;

        Ok(Self { card, crtc, timer })
    }

    fn crtc_has_framebuffer(card: &Card, handle: crtc::Handle) -> bool {
        let Ok(info) = card.get_crtc(handle) else {
            return false;
        };
        let Some(fb) = info.framebuffer() else {
            tracing::debug!("crtc {handle:?} has no framebuffer");
            return false;
        };
        match card.get_planar_framebuffer(fb) {
            Ok(planar) => planar.buffers()[0].is_some(),
            Err(err) => {
                tracing::debug!("crtc {handle:?}: {err}");
                false
            }
        }
    }

    /// Export the CRTC's current framebuffer as owned PRIME fds.
    fn grab_frame(&self) -> Result<FrameDescriptor, CaptureError> {
        let info = self
            .card
            .get_crtc(self.crtc)
            .map_err(std::io::Error::from)?;
        let fb = info.framebuffer().ok_or(CaptureError::NoCrtc)?;
        let planar = self
            .card
            .get_planar_framebuffer(fb)
            .map_err(|err| CaptureError::Drm(err.to_string()))?;

        let (width, height) = planar.size();
        let pitches = planar.pitches();
        let offsets = planar.offsets();
        let modifier = planar
            .modifier()
            .map(u64::from)
            .unwrap_or(0 /* DRM_FORMAT_MOD_LINEAR */);

        let mut planes = Vec::new();
        for (index, handle) in planar.buffers().iter().enumerate() {
            let Some(handle) = handle else { break };
            let fd = self
                .card
                .buffer_to_prime_fd(*handle, 0)
                .map_err(std::io::Error::from)?;
            planes.push(PlaneDescriptor {
                fd,
                offset: offsets[index],
                pitch: pitches[index],
                modifier,
            });
        }
        if planes.is_empty() {
            return Err(CaptureError::NoCrtc);
        }

        Ok(FrameDescriptor {
            width,
            height,
            fourcc: planar.pixel_format() as u32,
            planes,
        })
    }
}

impl CaptureSource for KmsCapture {
    fn events_fd(&self) -> RawFd {
        self.timer.as_raw_fd()
    }

    fn process_events(&mut self) -> Result<Option<FrameDescriptor>, CaptureError> {
        let mut expirations = [0u8; 8];
        rustix::io::read(&self.timer, &mut expirations).map_err(std::io::Error::from)?;
        let missed = u64::from_ne_bytes(expirations);
        if missed > 1 {
            tracing::trace!("capture timer missed {} ticks", missed - 1);
        }
        self.grab_frame().map(Some)
    }
}
