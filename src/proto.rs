//! Framed wire protocol between server and client.
//!
//! Every frame starts with an 8-byte little-endian header followed by
//! `size` bytes of payload:
//!
//! ```text
//!  0               4       5       6               8
//! +---------------+-------+-------+---------------+
//! | size (u32 LE) | type  | flags | latency_ms LE |  payload...
//! +---------------+-------+-------+---------------+
//! ```
//!
//! The client→server direction carries raw UHID records without this
//! header; see [`crate::input`].

use std::io::{self, ErrorKind, IoSlice, Read, Write};

pub const HEADER_SIZE: usize = 8;

/// Frame type discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Out-of-band control data; currently only the audio-config hello.
    Misc = 0,
    /// One H.264/HEVC access unit in Annex B framing.
    Video = 1,
    /// One period of interleaved S16LE PCM.
    Audio = 2,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameType::Misc),
            1 => Some(FrameType::Video),
            2 => Some(FrameType::Audio),
            _ => None,
        }
    }
}

pub mod flags {
    /// Set on IDR video frames and on the hello frame.
    pub const KEYFRAME: u8 = 1 << 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub size: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub latency_ms: u16,
}

impl FrameHeader {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.size.to_le_bytes());
        bytes[4] = self.frame_type as u8;
        bytes[5] = self.flags;
        bytes[6..8].copy_from_slice(&self.latency_ms.to_le_bytes());
        bytes
    }

    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> io::Result<Self> {
        let frame_type = FrameType::from_u8(bytes[4]).ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidData, format!("unknown frame type {}", bytes[4]))
        })?;
        Ok(Self {
            size: u32::from_le_bytes(bytes[..4].try_into().expect("header slice")),
            frame_type,
            flags: bytes[5],
            latency_ms: u16::from_le_bytes(bytes[6..8].try_into().expect("header slice")),
        })
    }
}

/// Write one frame with vectored I/O, resuming across partial writes and
/// retrying on EINTR. `BrokenPipe` (and any other error) is returned to
/// the caller, which tears the session down.
pub fn write_frame<W: Write>(
    out: &mut W,
    frame_type: FrameType,
    flags: u8,
    latency_ms: u16,
    payload: &[u8],
) -> io::Result<()> {
    let header = FrameHeader {
        size: payload.len() as u32,
        frame_type,
        flags,
        latency_ms,
    }
    .to_bytes();

    let total = HEADER_SIZE + payload.len();
    let mut written = 0usize;
    while written < total {
        let result = if written < HEADER_SIZE {
            out.write_vectored(&[IoSlice::new(&header[written..]), IoSlice::new(payload)])
        } else {
            out.write(&payload[written - HEADER_SIZE..])
        };
        match result {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "client socket accepted no bytes",
                ))
            }
            Ok(count) => written += count,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// First message after accept: the audio configuration the client should
/// prepare for, as a null-terminated string, flagged as a keyframe.
pub fn write_hello<W: Write>(out: &mut W, audio_config: &str) -> io::Result<()> {
    let mut payload = Vec::with_capacity(audio_config.len() + 1);
    payload.extend_from_slice(audio_config.as_bytes());
    payload.push(0);
    write_frame(out, FrameType::Misc, flags::KEYFRAME, 0, &payload)
}

/// Read one full frame; used by the test harness to play the client.
pub fn read_frame<R: Read>(input: &mut R) -> io::Result<(FrameHeader, Vec<u8>)> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    input.read_exact(&mut header_bytes)?;
    let header = FrameHeader::parse(&header_bytes)?;
    let mut payload = vec![0u8; header.size as usize];
    input.read_exact(&mut payload)?;
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that accepts at most `cap` bytes per call and can inject
    /// one error before any data flows.
    struct ThrottledWriter {
        data: Vec<u8>,
        cap: usize,
        pending_error: Option<ErrorKind>,
    }

    impl ThrottledWriter {
        fn new(cap: usize) -> Self {
            Self {
                data: Vec::new(),
                cap,
                pending_error: None,
            }
        }
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.pending_error.take() {
                return Err(io::Error::new(kind, "injected"));
            }
            let count = buf.len().min(self.cap);
            self.data.extend_from_slice(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader {
            size: 50_000,
            frame_type: FrameType::Video,
            flags: flags::KEYFRAME,
            latency_ms: 12,
        };
        let bytes = header.to_bytes();
        assert_eq!(FrameHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let header = FrameHeader {
            size: 0x0102_0304,
            frame_type: FrameType::Audio,
            flags: 0,
            latency_ms: 0x0a0b,
        };
        assert_eq!(header.to_bytes(), [0x04, 0x03, 0x02, 0x01, 2, 0, 0x0b, 0x0a]);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[4] = 9;
        assert!(FrameHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let payload: Vec<u8> = (0..=255).collect();
        let mut wire = Vec::new();
        write_frame(&mut wire, FrameType::Video, flags::KEYFRAME, 7, &payload).unwrap();
        assert_eq!(wire.len(), HEADER_SIZE + payload.len());

        let (header, body) = read_frame(&mut wire.as_slice()).unwrap();
        assert_eq!(header.size, 256);
        assert_eq!(header.frame_type, FrameType::Video);
        assert_eq!(header.flags, flags::KEYFRAME);
        assert_eq!(header.latency_ms, 7);
        assert_eq!(body, payload);
    }

    #[test]
    fn test_partial_writes_resume_to_completion() {
        let payload = vec![0xabu8; 50_000];
        // 3 bytes per call: the header itself needs three calls, and the
        // payload straddles thousands of boundaries.
        let mut writer = ThrottledWriter::new(3);
        write_frame(&mut writer, FrameType::Video, 0, 0, &payload).unwrap();
        assert_eq!(writer.data.len(), HEADER_SIZE + payload.len());
        let (header, body) = read_frame(&mut writer.data.as_slice()).unwrap();
        assert_eq!(header.size as usize, payload.len());
        assert_eq!(body, payload);
    }

    #[test]
    fn test_interrupted_is_retried() {
        let mut writer = ThrottledWriter::new(usize::MAX);
        writer.pending_error = Some(ErrorKind::Interrupted);
        write_frame(&mut writer, FrameType::Misc, 0, 0, b"ping").unwrap();
        let (header, body) = read_frame(&mut writer.data.as_slice()).unwrap();
        assert_eq!(header.frame_type, FrameType::Misc);
        assert_eq!(body, b"ping");
    }

    #[test]
    fn test_broken_pipe_aborts() {
        let mut writer = ThrottledWriter::new(usize::MAX);
        writer.pending_error = Some(ErrorKind::BrokenPipe);
        let err = write_frame(&mut writer, FrameType::Video, 0, 0, b"frame").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
        assert!(writer.data.is_empty());
    }

    #[test]
    fn test_hello_payload() {
        let mut wire = Vec::new();
        write_hello(&mut wire, "48000:FL,FR").unwrap();
        let (header, body) = read_frame(&mut wire.as_slice()).unwrap();
        assert_eq!(header.frame_type, FrameType::Misc);
        assert_eq!(header.flags, flags::KEYFRAME);
        assert_eq!(header.latency_ms, 0);
        assert_eq!(header.size, 12);
        assert_eq!(body, b"48000:FL,FR\0");
    }
}
