//! Process orchestration: one reactor, one optional client session.
//!
//! The server socket, GPU context and audio source live for the whole
//! process; an accepted client gets a session bundling its socket, the
//! capture source, the lazily created encoder and the UHID injector.
//! Any fatal per-session error raises `drop_client`, and the session is
//! torn down as one unit after the current reactor iteration, never
//! from inside a backend dispatch. A second connection while a session
//! is live is accepted and immediately closed.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};

use crate::audio::{AudioConfig, AudioSource};
use crate::capture::{self, CaptureSource};
use crate::encode::vaapi::VaDriver;
use crate::encode::Encoder;
use crate::gpu::{Colorspace, FrameDescriptor, GpuContext, GpuImage, Range};
use crate::input::UhidInjector;
use crate::perf::TimingStats;
use crate::proto::{self, FrameType};
use crate::reactor::Reactor;

// Captured desktops are sRGB; encode as BT.709 narrow range.
const COLORSPACE: Colorspace = Colorspace::Bt709;
const RANGE: Range = Range::Narrow;

pub struct ServerOpts {
    pub port: u16,
    pub disable_uhid: bool,
    pub audio: Option<AudioConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Accept,
    Client,
    InputEvents,
    CaptureEvents,
    AudioEvents,
}

/// Everything owned by one connected client. Field order is teardown
/// order: conversion target, encoder (VA state), capture source (joins
/// any backend thread), client socket, injector.
struct Session {
    encoder_image: Option<GpuImage>,
    encoder: Option<Encoder<VaDriver>>,
    capture: Box<dyn CaptureSource>,
    stream: TcpStream,
    injector: Option<UhidInjector>,
    drop_client: bool,
    convert_stats: TimingStats,
    encode_stats: TimingStats,
}

pub struct Server {
    listener: TcpListener,
    reactor: Reactor<Wake>,
    gpu: GpuContext,
    audio: Option<AudioSource>,
    session: Option<Session>,
    disable_uhid: bool,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(opts: ServerOpts, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let audio = opts
            .audio
            .map(AudioSource::new)
            .transpose()
            .context("failed to create audio source")?;
        let gpu = GpuContext::new(COLORSPACE, RANGE).context("failed to create gpu context")?;
        let listener = TcpListener::bind(("0.0.0.0", opts.port))
            .with_context(|| format!("failed to bind port {}", opts.port))?;
        let reactor = Reactor::new().context("failed to create reactor")?;

        Ok(Self {
            listener,
            reactor,
            gpu,
            audio,
            session: None,
            disable_uhid: opts.disable_uhid,
            shutdown,
        })
    }

    /// Reactor loop until a signal sets the shutdown flag. Per-session
    /// failures drop the client; only process-global failures (reactor,
    /// audio source) propagate out.
    pub fn run(&mut self) -> Result<()> {
        self.reactor
            .on_read(self.listener.as_raw_fd(), Wake::Accept)?;
        if let Some(audio) = &self.audio {
            self.reactor.on_read(audio.events_fd(), Wake::AudioEvents)?;
        }

        let mut fired = Vec::new();
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.reactor.iterate(None, &mut fired) {
                Ok(()) => {}
                // A signal interrupted the wait; the loop condition
                // observes the flag.
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("reactor wait failed"),
            }
            for index in 0..fired.len() {
                self.dispatch(fired[index])?;
            }
            if self.session.as_ref().is_some_and(|session| session.drop_client) {
                self.teardown_session();
            }
        }

        tracing::info!("shutting down");
        self.teardown_session();
        Ok(())
    }

    fn dispatch(&mut self, tag: Wake) -> Result<()> {
        match tag {
            Wake::Accept => self.handle_accept(),
            Wake::Client => self.handle_client(),
            Wake::InputEvents => self.handle_input_events(),
            Wake::CaptureEvents => self.handle_capture_events(),
            Wake::AudioEvents => self.handle_audio_events(),
        }
    }

    fn handle_accept(&mut self) -> Result<()> {
        self.reactor
            .on_read(self.listener.as_raw_fd(), Wake::Accept)?;
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
                ) =>
            {
                return Ok(())
            }
            Err(err) => return Err(err).context("accept failed"),
        };

        if self.session.is_some() {
            tracing::info!("busy with a client, rejecting {peer}");
            return Ok(());
        }

        tracing::info!("accepted client {peer}");
        match self.create_session(stream) {
            Ok(session) => {
                let client_fd = session.stream.as_raw_fd();
                let capture_fd = session.capture.events_fd();
                let injector_fd = session.injector.as_ref().map(UhidInjector::events_raw_fd);
                self.session = Some(session);
                self.reactor.on_read(client_fd, Wake::Client)?;
                self.reactor.on_read(capture_fd, Wake::CaptureEvents)?;
                if let Some(fd) = injector_fd {
                    self.reactor.on_read(fd, Wake::InputEvents)?;
                }
            }
            Err(err) => tracing::warn!("failed to start session: {err:#}"),
        }
        Ok(())
    }

    fn create_session(&mut self, stream: TcpStream) -> Result<Session> {
        stream.set_nodelay(true).context("failed to disable Nagle")?;

        let injector = if self.disable_uhid {
            None
        } else {
            Some(UhidInjector::open().context("failed to open uhid device")?)
        };
        let capture = capture::create().context("failed to create capture source")?;

        if let Some(audio) = &self.audio {
            proto::write_hello(&mut &stream, &audio.config().to_string())
                .context("failed to send hello frame")?;
        }

        Ok(Session {
            encoder_image: None,
            encoder: None,
            capture,
            stream,
            injector,
            drop_client: false,
            convert_stats: TimingStats::default(),
            encode_stats: TimingStats::default(),
        })
    }

    fn handle_client(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        self.reactor
            .on_read(session.stream.as_raw_fd(), Wake::Client)?;

        let mut chunk = [0u8; 4096];
        match (&session.stream).read(&mut chunk) {
            Ok(0) => {
                tracing::info!("client closed the connection");
                session.drop_client = true;
            }
            Ok(count) => {
                // With uhid disabled the bytes are drained and dropped.
                if let Some(injector) = session.injector.as_mut() {
                    if let Err(err) = injector.handle_chunk(&chunk[..count]) {
                        tracing::warn!("input injection failed: {err}");
                        session.drop_client = true;
                    }
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
                ) => {}
            Err(err) => {
                tracing::warn!("client read failed: {err}");
                session.drop_client = true;
            }
        }
        Ok(())
    }

    fn handle_input_events(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(injector) = session.injector.as_mut() else {
            return Ok(());
        };
        self.reactor
            .on_read(injector.events_raw_fd(), Wake::InputEvents)?;
        if let Err(err) = injector.process_events() {
            tracing::warn!("uhid event drain failed: {err}");
            session.drop_client = true;
        }
        Ok(())
    }

    fn handle_capture_events(&mut self) -> Result<()> {
        let capture_start = Instant::now();
        let frame = {
            let Some(session) = self.session.as_mut() else {
                return Ok(());
            };
            self.reactor
                .on_read(session.capture.events_fd(), Wake::CaptureEvents)?;
            match session.capture.process_events() {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!("capture failed: {err}");
                    session.drop_client = true;
                    None
                }
            }
        };
        if let Some(frame) = frame {
            self.encode_tick(frame, capture_start);
        }
        Ok(())
    }

    /// One frame through the pipeline: import, convert, encode, write.
    fn encode_tick(&mut self, frame: FrameDescriptor, capture_start: Instant) {
        let gpu = &self.gpu;
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if let Err(err) = Self::tick_session(gpu, session, frame, capture_start) {
            if is_clean_disconnect(&err) {
                tracing::info!("client went away");
            } else {
                tracing::warn!("video pipeline failed: {err:#}");
            }
            session.drop_client = true;
        }
    }

    fn tick_session(
        gpu: &GpuContext,
        session: &mut Session,
        frame: FrameDescriptor,
        capture_start: Instant,
    ) -> Result<()> {
        if session.encoder.is_none() {
            // Dimensions only become known with the first frame.
            tracing::info!("starting encoder for {frame}");
            let driver = VaDriver::new(frame.width, frame.height)
                .context("failed to create encoder")?;
            let input_frame = driver
                .export_input_frame()
                .context("failed to export encoder input surface")?;
            let image = gpu
                .import_frame(input_frame)
                .context("failed to import encoder input surface")?;
            let encoder = Encoder::new(driver, frame.width, frame.height, COLORSPACE, RANGE)
                .context("failed to configure encoder")?;
            session.encoder = Some(encoder);
            session.encoder_image = Some(image);
        }
        let (Some(encoder), Some(encoder_image)) =
            (session.encoder.as_mut(), session.encoder_image.as_ref())
        else {
            return Ok(());
        };

        let captured = gpu
            .import_frame(frame)
            .context("failed to import captured frame")?;
        let convert_start = Instant::now();
        gpu.convert(&captured, encoder_image)
            .context("failed to convert captured frame")?;
        session
            .convert_stats
            .record(convert_start.elapsed().as_micros() as u64);
        drop(captured);

        let encode_start = Instant::now();
        encoder
            .encode_frame(&mut &session.stream, capture_start)
            .context("failed to encode frame")?;
        session
            .encode_stats
            .record(encode_start.elapsed().as_micros() as u64);
        Ok(())
    }

    fn handle_audio_events(&mut self) -> Result<()> {
        let Some(audio) = self.audio.as_mut() else {
            return Ok(());
        };
        self.reactor.on_read(audio.events_fd(), Wake::AudioEvents)?;
        // Audio outlives sessions; a dead capture thread is fatal to the
        // process, not to the client.
        let blocks = audio
            .process_events()
            .context("audio capture stopped")?;

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        for block in blocks {
            let latency_ms = audio.latency_ms(block.len());
            if let Err(err) =
                proto::write_frame(&mut &session.stream, FrameType::Audio, 0, latency_ms, &block)
            {
                if err.kind() == std::io::ErrorKind::BrokenPipe {
                    tracing::info!("client went away");
                } else {
                    tracing::warn!("audio write failed: {err}");
                }
                session.drop_client = true;
                break;
            }
        }
        Ok(())
    }

    /// Destroy the live session as one unit: forget its fds, then drop
    /// encoder, capture source, socket and injector in that order. The
    /// audio source, GPU context and server socket stay up.
    fn teardown_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let _ = self.reactor.forget(session.stream.as_raw_fd());
        let _ = self.reactor.forget(session.capture.events_fd());
        if let Some(injector) = &session.injector {
            let _ = self.reactor.forget(injector.events_raw_fd());
        }
        session.convert_stats.log("convert");
        session.encode_stats.log("encode");
        tracing::info!(
            "session ended after {} frames",
            session.encode_stats.count()
        );
        drop(session);
    }
}

/// EPIPE and its cousins are a clean goodbye, not an error.
fn is_clean_disconnect(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io_err| {
                matches!(
                    io_err.kind(),
                    std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
                )
            })
    })
}
