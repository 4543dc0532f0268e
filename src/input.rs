//! Injection of client HID reports through /dev/uhid.
//!
//! The client forwards raw `uhid_event` records with no extra framing;
//! the record length follows from the event type (first 4 bytes LE):
//!
//! * `UHID_CREATE2`: fixed preamble up to `rd_data`, plus `rd_size`
//!   bytes of report descriptor,
//! * `UHID_INPUT2`: 4-byte type, 2-byte `size`, then `size` bytes,
//! * `UHID_DESTROY`: the type word alone.
//!
//! TCP chunking is arbitrary, so partial records accumulate in a buffer
//! until complete, and each complete record is written to the uhid fd in
//! a single atomic write.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use rustix::fs::{Mode, OFlags};
use thiserror::Error;

const UHID_DEVICE: &str = "/dev/uhid";

// Event types from linux/uhid.h.
const UHID_DESTROY: u32 = 1;
const UHID_CREATE2: u32 = 11;
const UHID_INPUT2: u32 = 12;

// struct uhid_create2_req: name[128] phys[64] uniq[64] rd_size bus
// vendor product version country rd_data[HID_MAX_DESCRIPTOR_SIZE].
const CREATE2_RD_SIZE_OFFSET: usize = 4 + 128 + 64 + 64;
const CREATE2_RD_DATA_OFFSET: usize = CREATE2_RD_SIZE_OFFSET + 2 + 2 + 4 + 4 + 4 + 4;
const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

// struct uhid_input2_req: u16 size, u8 data[UHID_DATA_MAX].
const INPUT2_SIZE_OFFSET: usize = 4;
const INPUT2_DATA_OFFSET: usize = 6;
const UHID_DATA_MAX: usize = 4096;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("unexpected uhid event type {0}")]
    UnknownType(u32),
    #[error("uhid {kind} record declares {size} bytes (limit {limit})")]
    OversizedRecord {
        kind: &'static str,
        size: usize,
        limit: usize,
    },
    #[error("short write to uhid device ({written} of {size} bytes)")]
    ShortWrite { written: usize, size: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct UhidInjector {
    fd: OwnedFd,
    buffer: Vec<u8>,
}

impl UhidInjector {
    /// Open the kernel uhid device node.
    pub fn open() -> Result<Self, InputError> {
        let fd = rustix::fs::open(UHID_DEVICE, OFlags::RDWR, Mode::empty())
            .map_err(std::io::Error::from)?;
        Ok(Self::from_fd(fd))
    }

    /// Build an injector around an arbitrary fd; the tests use a pipe.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd,
            buffer: Vec::new(),
        }
    }

    /// Fd carrying kernel-originated uhid events (report requests and
    /// the like); the reactor watches it so they can be drained.
    pub fn events_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn events_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Read and discard one kernel event. Nothing upstream consumes
    /// them; draining keeps the fd from staying readable forever.
    pub fn process_events(&mut self) -> Result<(), InputError> {
        let mut event = [0u8; 4380]; // sizeof(struct uhid_event)
        rustix::io::read(&self.fd, &mut event).map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Append one TCP chunk and inject every record that is now
    /// complete. Leftover bytes wait for the next chunk.
    pub fn handle_chunk(&mut self, chunk: &[u8]) -> Result<(), InputError> {
        self.buffer.extend_from_slice(chunk);

        while let Some(size) = self.complete_record_len()? {
            let written =
                rustix::io::write(&self.fd, &self.buffer[..size]).map_err(std::io::Error::from)?;
            if written != size {
                return Err(InputError::ShortWrite { written, size });
            }
            self.buffer.drain(..size);
        }
        Ok(())
    }

    /// Length of the record at the head of the buffer, or `None` when
    /// more bytes are needed to know.
    fn complete_record_len(&self) -> Result<Option<usize>, InputError> {
        let buffer = &self.buffer;
        if buffer.len() < 4 {
            return Ok(None);
        }
        let event_type = u32::from_le_bytes(buffer[..4].try_into().expect("length checked"));
        let size = match event_type {
            UHID_CREATE2 => {
                if buffer.len() < CREATE2_RD_SIZE_OFFSET + 2 {
                    return Ok(None);
                }
                let rd_size = u16::from_le_bytes(
                    buffer[CREATE2_RD_SIZE_OFFSET..CREATE2_RD_SIZE_OFFSET + 2]
                        .try_into()
                        .expect("length checked"),
                ) as usize;
                if rd_size > HID_MAX_DESCRIPTOR_SIZE {
                    return Err(InputError::OversizedRecord {
                        kind: "CREATE2",
                        size: rd_size,
                        limit: HID_MAX_DESCRIPTOR_SIZE,
                    });
                }
                CREATE2_RD_DATA_OFFSET + rd_size
            }
            UHID_INPUT2 => {
                if buffer.len() < INPUT2_SIZE_OFFSET + 2 {
                    return Ok(None);
                }
                let data_size = u16::from_le_bytes(
                    buffer[INPUT2_SIZE_OFFSET..INPUT2_SIZE_OFFSET + 2]
                        .try_into()
                        .expect("length checked"),
                ) as usize;
                if data_size > UHID_DATA_MAX {
                    return Err(InputError::OversizedRecord {
                        kind: "INPUT2",
                        size: data_size,
                        limit: UHID_DATA_MAX,
                    });
                }
                INPUT2_DATA_OFFSET + data_size
            }
            UHID_DESTROY => 4,
            other => return Err(InputError::UnknownType(other)),
        };
        Ok((buffer.len() >= size).then_some(size))
    }
}
