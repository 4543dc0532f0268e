//! Audio capture: configuration grammar, the capture-thread handoff
//! queue, and the waker pipe that marshals completions back into the
//! reactor.
//!
//! The config string has the shape `<rate>:<pos>(,<pos>)*`, e.g.
//! `48000:FL,FR`. The same string is sent verbatim to the client in the
//! hello frame so both ends configure identically.
//!
//! The actual capture stream (cpal) runs on a library-owned real-time
//! thread and is gated behind the `audio` feature; everything else here
//! compiles unconditionally so the grammar and the handoff protocol stay
//! testable on headless machines.

#[cfg(feature = "audio")]
mod stream;

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::buffer_queue::BufferQueue;

/// Upper bound on channel map entries, matching the capture stack.
pub const MAX_CHANNELS: usize = 64;

/// Status bytes travelling through the waker pipe.
const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

#[derive(Debug, Error)]
pub enum AudioConfigError {
    #[error("audio config is missing the ':' separator")]
    MissingSeparator,
    #[error("unsupported sample rate {0} (expected 44100 or 48000)")]
    BadRate(String),
    #[error("unknown channel position {0:?}")]
    UnknownChannel(String),
    #[error("channel map has no entries")]
    EmptyChannelMap,
    #[error("channel map has more than {MAX_CHANNELS} entries")]
    TooManyChannels,
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio capture thread reported an error")]
    Thread,
    #[error("audio support not compiled in (rebuild with --features audio)")]
    Disabled,
    #[error("{0}")]
    Stream(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

macro_rules! channel_positions {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Speaker positions accepted in the channel map.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum ChannelPosition {
            $($variant,)+
        }

        impl ChannelPosition {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(ChannelPosition::$variant => $name,)+
                }
            }
        }

        impl FromStr for ChannelPosition {
            type Err = AudioConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(ChannelPosition::$variant),)+
                    other => Err(AudioConfigError::UnknownChannel(other.to_owned())),
                }
            }
        }
    };
}

channel_positions! {
    Fl => "FL", Fr => "FR", Fc => "FC", Lfe => "LFE", Sl => "SL", Sr => "SR",
    Flc => "FLC", Frc => "FRC", Rc => "RC", Rl => "RL", Rr => "RR", Tc => "TC",
    Tfl => "TFL", Tfc => "TFC", Tfr => "TFR", Trl => "TRL", Trc => "TRC",
    Trr => "TRR", Rlc => "RLC", Rrc => "RRC", Flw => "FLW", Frw => "FRW",
    Lfe2 => "LFE2", Flh => "FLH", Fch => "FCH", Frh => "FRH", Tflc => "TFLC",
    Tfrc => "TFRC", Tsl => "TSL", Tsr => "TSR", Llfe => "LLFE", Rlfe => "RLFE",
    Bc => "BC", Blc => "BLC", Brc => "BRC",
}

/// Parsed `<rate>:<channel_map>` capture configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    pub rate: u32,
    pub channels: Vec<ChannelPosition>,
}

impl AudioConfig {
    /// Bytes of one second of interleaved S16LE at this configuration.
    pub fn one_second_size(&self) -> u32 {
        self.channels.len() as u32 * self.rate * 2
    }
}

impl FromStr for AudioConfig {
    type Err = AudioConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rate, map) = s.split_once(':').ok_or(AudioConfigError::MissingSeparator)?;
        let rate: u32 = rate
            .parse()
            .map_err(|_| AudioConfigError::BadRate(rate.to_owned()))?;
        if rate != 44100 && rate != 48000 {
            return Err(AudioConfigError::BadRate(rate.to_string()));
        }
        if map.is_empty() {
            return Err(AudioConfigError::EmptyChannelMap);
        }
        let channels = map
            .split(',')
            .map(ChannelPosition::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        if channels.len() > MAX_CHANNELS {
            return Err(AudioConfigError::TooManyChannels);
        }
        Ok(Self { rate, channels })
    }
}

impl fmt::Display for AudioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.rate)?;
        for (index, channel) in self.channels.iter().enumerate() {
            if index > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", channel.as_str())?;
        }
        Ok(())
    }
}

/// Handle shared with the capture thread: the blob queue plus the write
/// end of the waker pipe.
#[cfg_attr(not(feature = "audio"), allow(dead_code))]
pub(crate) struct CaptureShared {
    queue: Arc<BufferQueue>,
    waker_tx: OwnedFd,
}

#[cfg_attr(not(feature = "audio"), allow(dead_code))]
impl CaptureShared {
    /// Called from the real-time thread for every captured period.
    pub(crate) fn deliver(&self, block: Box<[u8]>) {
        self.queue.push(block);
        self.wake(STATUS_OK);
    }

    /// Called from the real-time thread when the stream dies.
    pub(crate) fn fail(&self) {
        self.wake(STATUS_ERR);
    }

    fn wake(&self, status: u8) {
        // A full pipe means the main thread is hopelessly behind; the
        // status byte would be merged with pending ones anyway.
        let _ = rustix::io::write(&self.waker_tx, &[status]);
    }
}

/// PCM capture source. Owns the capture thread, the handoff queue and
/// the waker pipe; the main loop watches [`events_fd`] and calls
/// [`process_events`] when it fires.
///
/// [`events_fd`]: AudioSource::events_fd
/// [`process_events`]: AudioSource::process_events
pub struct AudioSource {
    config: AudioConfig,
    one_second_size: u32,
    queue: Arc<BufferQueue>,
    waker_rx: OwnedFd,
    #[cfg(feature = "audio")]
    _stream: Option<stream::CaptureStream>,
}

impl AudioSource {
    #[cfg(feature = "audio")]
    pub fn new(config: AudioConfig) -> Result<Self, AudioError> {
        let (waker_rx, waker_tx) = rustix::pipe::pipe().map_err(std::io::Error::from)?;
        let queue = Arc::new(BufferQueue::new());
        let shared = CaptureShared {
            queue: queue.clone(),
            waker_tx,
        };
        let stream = stream::CaptureStream::start(&config, shared)?;
        Ok(Self {
            one_second_size: config.one_second_size(),
            config,
            queue,
            waker_rx,
            _stream: Some(stream),
        })
    }

    #[cfg(not(feature = "audio"))]
    pub fn new(_config: AudioConfig) -> Result<Self, AudioError> {
        Err(AudioError::Disabled)
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn events_fd(&self) -> RawFd {
        self.waker_rx.as_raw_fd()
    }

    /// Consume one waker byte and drain every queued block. An ERR
    /// status means the capture thread stopped; the caller treats that
    /// as fatal.
    pub fn process_events(&mut self) -> Result<Vec<Box<[u8]>>, AudioError> {
        let mut status = [0u8; 1];
        rustix::io::read(&self.waker_rx, &mut status).map_err(std::io::Error::from)?;
        if status[0] == STATUS_ERR {
            return Err(AudioError::Thread);
        }

        let mut blocks = Vec::new();
        while let Some(block) = self.queue.pop() {
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Latency hint for one block: how much audio it represents.
    pub fn latency_us(&self, bytes: usize) -> u64 {
        bytes as u64 * 1_000_000 / u64::from(self.one_second_size)
    }

    pub fn latency_ms(&self, bytes: usize) -> u16 {
        (self.latency_us(bytes) / 1000).min(u64::from(u16::MAX)) as u16
    }

    /// Test seam: a source fed by hand instead of a capture thread.
    #[cfg(test)]
    fn piped(config: AudioConfig) -> (Self, CaptureShared) {
        let (waker_rx, waker_tx) = rustix::pipe::pipe().expect("pipe");
        let queue = Arc::new(BufferQueue::new());
        let shared = CaptureShared {
            queue: queue.clone(),
            waker_tx,
        };
        (
            Self {
                one_second_size: config.one_second_size(),
                config,
                queue,
                waker_rx,
                #[cfg(feature = "audio")]
                _stream: None,
            },
            shared,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_stereo() {
        let config: AudioConfig = "48000:FL,FR".parse().unwrap();
        assert_eq!(config.rate, 48000);
        assert_eq!(
            config.channels,
            vec![ChannelPosition::Fl, ChannelPosition::Fr]
        );
        assert_eq!(config.one_second_size(), 2 * 48000 * 2);
        assert_eq!(config.to_string(), "48000:FL,FR");
    }

    #[test]
    fn test_parse_exotic_positions() {
        let config: AudioConfig = "44100:FL,FR,FC,LFE,SL,SR,TFL,TFR,LLFE,BC".parse().unwrap();
        assert_eq!(config.channels.len(), 10);
        assert_eq!(config.to_string(), "44100:FL,FR,FC,LFE,SL,SR,TFL,TFR,LLFE,BC");
    }

    #[test]
    fn test_all_positions_parse() {
        for name in [
            "FL", "FR", "FC", "LFE", "SL", "SR", "FLC", "FRC", "RC", "RL", "RR", "TC", "TFL",
            "TFC", "TFR", "TRL", "TRC", "TRR", "RLC", "RRC", "FLW", "FRW", "LFE2", "FLH", "FCH",
            "FRH", "TFLC", "TFRC", "TSL", "TSR", "LLFE", "RLFE", "BC", "BLC", "BRC",
        ] {
            let position: ChannelPosition = name.parse().unwrap();
            assert_eq!(position.as_str(), name);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            "48000".parse::<AudioConfig>(),
            Err(AudioConfigError::MissingSeparator)
        ));
        assert!(matches!(
            "22050:FL,FR".parse::<AudioConfig>(),
            Err(AudioConfigError::BadRate(_))
        ));
        assert!(matches!(
            "x:FL".parse::<AudioConfig>(),
            Err(AudioConfigError::BadRate(_))
        ));
        assert!(matches!(
            "48000:".parse::<AudioConfig>(),
            Err(AudioConfigError::EmptyChannelMap)
        ));
        assert!(matches!(
            "48000:FL,XX".parse::<AudioConfig>(),
            Err(AudioConfigError::UnknownChannel(_))
        ));
        assert!(matches!(
            "48000:fl".parse::<AudioConfig>(),
            Err(AudioConfigError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_latency_math() {
        let (source, _shared) = AudioSource::piped("48000:FL,FR".parse().unwrap());
        // One second of stereo S16LE is 192000 bytes.
        assert_eq!(source.latency_us(192_000), 1_000_000);
        assert_eq!(source.latency_ms(19_200), 100);
        assert_eq!(source.latency_ms(0), 0);
    }

    #[test]
    fn test_process_events_drains_in_order() {
        let (mut source, shared) = AudioSource::piped("48000:FL,FR".parse().unwrap());
        shared.deliver(Box::new([1u8; 4]));
        shared.deliver(Box::new([2u8; 4]));

        // One waker byte is enough; the drain takes everything queued.
        let blocks = source.process_events().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].as_ref(), &[1u8; 4]);
        assert_eq!(blocks[1].as_ref(), &[2u8; 4]);
    }

    #[test]
    fn test_thread_error_is_fatal() {
        let (mut source, shared) = AudioSource::piped("44100:FL".parse().unwrap());
        shared.fail();
        assert!(matches!(source.process_events(), Err(AudioError::Thread)));
    }
}
