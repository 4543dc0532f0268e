//! cpal-backed PCM capture stream.
//!
//! The cpal `Stream` is `!Send`, so it lives on a dedicated OS thread
//! that parks until the owning [`CaptureStream`] is dropped. The data
//! callback runs on the backend's real-time thread; it only copies the
//! period into the queue and pokes the waker pipe, per-block work stays
//! off the main loop.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};

use super::{AudioConfig, AudioError, CaptureShared};

pub(crate) struct CaptureStream {
    _keep_alive: mpsc::Sender<()>,
}

impl CaptureStream {
    pub(crate) fn start(
        config: &AudioConfig,
        shared: CaptureShared,
    ) -> Result<Self, AudioError> {
        let (keep_tx, keep_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        let stream_config = StreamConfig {
            channels: config.channels.len() as u16,
            sample_rate: SampleRate(config.rate),
            buffer_size: BufferSize::Default,
        };

        thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_input_device() {
                Some(device) => device,
                None => {
                    let _ = ready_tx.send(Err("no audio input device found".into()));
                    return;
                }
            };
            let name = device.name().unwrap_or_else(|_| "unknown".into());

            let shared = Arc::new(shared);
            let data_shared = shared.clone();
            let error_shared = shared.clone();
            let stream = match device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let mut block = Vec::with_capacity(data.len() * 2);
                    for sample in data {
                        block.extend_from_slice(&sample.to_le_bytes());
                    }
                    data_shared.deliver(block.into_boxed_slice());
                },
                move |err| {
                    tracing::warn!("audio input stream error: {err}");
                    error_shared.fail();
                },
                None,
            ) {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = ready_tx.send(Err(format!("failed to build input stream: {err}")));
                    return;
                }
            };

            if let Err(err) = stream.play() {
                let _ = ready_tx.send(Err(format!("failed to start input stream: {err}")));
                return;
            }

            tracing::info!(
                "audio capture started on {} ({} Hz, {} channels)",
                name,
                stream_config.sample_rate.0,
                stream_config.channels
            );
            let _ = ready_tx.send(Ok(()));

            // Park until the AudioSource goes away; dropping the stream
            // here joins the backend's capture machinery.
            let _ = keep_rx.recv();
            drop(stream);
        });

        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(())) => Ok(Self {
                _keep_alive: keep_tx,
            }),
            Ok(Err(message)) => Err(AudioError::Stream(message)),
            Err(_) => Err(AudioError::Stream(
                "audio capture thread did not start in time".into(),
            )),
        }
    }
}
