//! End-to-end pipeline scenarios against a recording mock codec driver.

use std::io::Cursor;
use std::time::Instant;

use lancast::encode::bitstream::Bitstream;
use lancast::encode::params::{
    DriverCaps, FrameRateParams, PackedHeaderCaps, PicParams, RateControlParams, SeqParams,
    SliceParams, SurfaceId,
};
use lancast::encode::{CodecDriver, Encoder, EncoderError, PackedHeaderKind, INTRA_IDR_PERIOD};
use lancast::gpu::{Colorspace, Range};
use lancast::input::UhidInjector;
use lancast::proto::{self, flags, FrameHeader, FrameType};

const NUT_TRAIL_R: u8 = 1;
const NUT_IDR_W_RADL: u8 = 19;

#[derive(Default)]
struct Recording {
    sequences: Vec<SeqParams>,
    rate_controls: usize,
    frame_rates: usize,
    pictures: Vec<PicParams>,
    slices: Vec<SliceParams>,
    packed_sequences: Vec<Vec<u8>>,
    packed_slices: Vec<Vec<u8>>,
}

/// Mock driver: records every upload and emits canned coded buffers.
struct MockDriver {
    caps: DriverCaps,
    surfaces: Vec<SurfaceId>,
    coded_sizes: Vec<usize>,
    frames_emitted: usize,
    log: Recording,
}

impl MockDriver {
    fn new(packed_headers: PackedHeaderCaps) -> Self {
        Self {
            caps: DriverCaps {
                packed_headers,
                features: None,
                block_sizes: None,
            },
            surfaces: vec![SurfaceId(100), SurfaceId(101)],
            coded_sizes: vec![50_000, 1_200, 1_300],
            frames_emitted: 0,
            log: Recording::default(),
        }
    }

    fn coded_size_for(&self, frame: usize) -> usize {
        self.coded_sizes[frame % self.coded_sizes.len()]
    }
}

impl CodecDriver for MockDriver {
    fn caps(&self) -> DriverCaps {
        self.caps
    }

    fn input_surface(&self) -> SurfaceId {
        SurfaceId(7)
    }

    fn recon_surfaces(&self) -> &[SurfaceId] {
        &self.surfaces
    }

    fn upload_sequence(&mut self, seq: &SeqParams) -> Result<(), EncoderError> {
        self.log.sequences.push(seq.clone());
        Ok(())
    }

    fn upload_rate_control(&mut self, _rc: &RateControlParams) -> Result<(), EncoderError> {
        self.log.rate_controls += 1;
        Ok(())
    }

    fn upload_frame_rate(&mut self, _fr: &FrameRateParams) -> Result<(), EncoderError> {
        self.log.frame_rates += 1;
        Ok(())
    }

    fn upload_picture(&mut self, pic: &PicParams) -> Result<(), EncoderError> {
        self.log.pictures.push(pic.clone());
        Ok(())
    }

    fn upload_slice(&mut self, slice: &SliceParams) -> Result<(), EncoderError> {
        self.log.slices.push(slice.clone());
        Ok(())
    }

    fn upload_packed_header(
        &mut self,
        kind: PackedHeaderKind,
        header: &Bitstream,
    ) -> Result<(), EncoderError> {
        match kind {
            PackedHeaderKind::Sequence => {
                self.log.packed_sequences.push(header.data().to_vec())
            }
            PackedHeaderKind::Slice => self.log.packed_slices.push(header.data().to_vec()),
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<Vec<u8>, EncoderError> {
        let size = self.coded_size_for(self.frames_emitted);
        self.frames_emitted += 1;
        Ok(vec![0xEC; size])
    }
}

fn run_frames(encoder: &mut Encoder<MockDriver>, wire: &mut Vec<u8>, count: usize) {
    for _ in 0..count {
        encoder
            .encode_frame(wire, Instant::now())
            .expect("mock encode cannot fail");
    }
}

fn parse_wire(wire: &[u8]) -> Vec<(FrameHeader, Vec<u8>)> {
    let mut cursor = Cursor::new(wire);
    let mut frames = Vec::new();
    while (cursor.position() as usize) < wire.len() {
        frames.push(proto::read_frame(&mut cursor).expect("well-formed stream"));
    }
    frames
}

fn nal_unit_type(packed: &[u8]) -> u8 {
    assert_eq!(&packed[..4], &[0, 0, 0, 1], "missing start code");
    packed[4] >> 1
}

#[test]
fn single_client_ten_frames() {
    let driver = MockDriver::new(PackedHeaderCaps {
        sequence: true,
        slice: true,
        misc: false,
    });
    let expected_total: usize = (0..10).map(|frame| driver.coded_size_for(frame)).sum();

    let mut encoder =
        Encoder::new(driver, 1920, 1080, Colorspace::Bt709, Range::Narrow).unwrap();
    let mut wire = Vec::new();
    run_frames(&mut encoder, &mut wire, 10);
    assert_eq!(encoder.frame_counter(), 10);

    let frames = parse_wire(&wire);
    assert_eq!(frames.len(), 10);
    for (index, (header, payload)) in frames.iter().enumerate() {
        assert_eq!(header.frame_type, FrameType::Video);
        assert_eq!(header.size as usize, payload.len());
        if index == 0 {
            assert_ne!(header.flags & flags::KEYFRAME, 0, "frame 0 must be IDR");
        } else {
            assert_eq!(header.flags & flags::KEYFRAME, 0, "frame {index} must be P");
        }
        // Latency is measured around the encode call; a mock encode
        // takes well under a second.
        assert!(header.latency_ms < 1000);
    }
    let total: usize = frames.iter().map(|(_, payload)| payload.len()).sum();
    assert_eq!(total, expected_total);
}

#[test]
fn packed_headers_and_references() {
    let driver = MockDriver::new(PackedHeaderCaps {
        sequence: true,
        slice: true,
        misc: false,
    });
    let mut encoder =
        Encoder::new(driver, 1280, 720, Colorspace::Bt709, Range::Narrow).unwrap();
    let mut wire = Vec::new();
    run_frames(&mut encoder, &mut wire, 5);

    let log = &encoder.driver().log;

    // One sequence upload (frame 0 only), with RC + frame rate next to it.
    assert_eq!(log.sequences.len(), 1);
    assert_eq!(log.rate_controls, 1);
    assert_eq!(log.frame_rates, 1);
    assert_eq!(log.packed_sequences.len(), 1);
    assert_eq!(log.packed_slices.len(), 5);

    // The packed sequence blob opens with a VPS NAL (nut 32).
    assert_eq!(nal_unit_type(&log.packed_sequences[0]), 32);

    // Slice headers: IDR_W_RADL once, then TRAIL_R.
    assert_eq!(nal_unit_type(&log.packed_slices[0]), NUT_IDR_W_RADL);
    for slice in &log.packed_slices[1..] {
        assert_eq!(nal_unit_type(slice), NUT_TRAIL_R);
    }

    // Picture parameters: frame 0 clears references; every P frame
    // references the previous reconstruction surface and POC, with the
    // ring alternating between its two surfaces.
    assert!(log.pictures[0].idr_pic);
    assert_eq!(log.pictures[0].coding_type, 1);
    assert_eq!(
        log.pictures[0].reference_frames[0].surface,
        SurfaceId::INVALID
    );
    for (index, pic) in log.pictures.iter().enumerate().skip(1) {
        assert!(!pic.idr_pic);
        assert_eq!(pic.coding_type, 2);
        assert_eq!(pic.nal_unit_type, NUT_TRAIL_R);
        assert_eq!(pic.decoded_curr_pic.poc, index as u32);
        assert_eq!(pic.decoded_curr_pic.surface, SurfaceId(100 + index as u32 % 2));
        let reference = &pic.reference_frames[0];
        assert_eq!(reference.poc, index as u32 - 1);
        assert_eq!(reference.surface, SurfaceId(100 + (index as u32 + 1) % 2));
    }

    // Slice parameters mirror the P reference in list 0.
    assert!(log.slices[0].ref_pic_list0[0].surface == SurfaceId::INVALID);
    assert!(log.slices[0].negative_pics.is_empty());
    for (index, slice) in log.slices.iter().enumerate().skip(1) {
        assert_eq!(slice.ref_pic_list0[0].poc, index as u32 - 1);
        assert_eq!(slice.negative_pics.len(), 1);
        assert_eq!(slice.negative_pics[0].delta_poc_minus1, 0);
        assert!(slice.negative_pics[0].used_by_curr_pic);
    }
}

#[test]
fn sequence_buffer_uploaded_without_packed_header_support() {
    let driver = MockDriver::new(PackedHeaderCaps {
        sequence: false,
        slice: false,
        misc: false,
    });
    let mut encoder =
        Encoder::new(driver, 640, 480, Colorspace::Bt601, Range::Full).unwrap();
    let mut wire = Vec::new();
    run_frames(&mut encoder, &mut wire, 3);

    let log = &encoder.driver().log;
    // The VA sequence buffer still goes up on IDR, but nothing packed.
    assert_eq!(log.sequences.len(), 1);
    assert!(log.packed_sequences.is_empty());
    assert!(log.packed_slices.is_empty());
    assert_eq!(log.pictures.len(), 3);
}

#[test]
fn idr_cadence_over_241_frames() {
    let driver = MockDriver::new(PackedHeaderCaps {
        sequence: true,
        slice: true,
        misc: false,
    });
    let mut encoder =
        Encoder::new(driver, 1920, 1080, Colorspace::Bt709, Range::Narrow).unwrap();
    let mut wire = Vec::new();
    run_frames(&mut encoder, &mut wire, 241);

    let frames = parse_wire(&wire);
    assert_eq!(frames.len(), 241);
    let keyframes: Vec<usize> = frames
        .iter()
        .enumerate()
        .filter(|(_, (header, _))| header.flags & flags::KEYFRAME != 0)
        .map(|(index, _)| index)
        .collect();
    assert_eq!(keyframes, vec![0, 120, 240]);

    // POC wraps with the IDR period while the counter is monotonic.
    let log = &encoder.driver().log;
    assert_eq!(log.pictures[120].decoded_curr_pic.poc, 0);
    assert_eq!(log.pictures[239].decoded_curr_pic.poc, 119);
    assert_eq!(log.pictures[240].decoded_curr_pic.poc, 0);
    assert_eq!(encoder.frame_counter(), 241);
    assert_eq!(u64::from(INTRA_IDR_PERIOD), 120);

    // Three IDRs, three sequence uploads.
    assert_eq!(log.sequences.len(), 3);
    assert_eq!(log.packed_sequences.len(), 3);
}

#[test]
fn audio_hello_is_first_message() {
    let config: lancast::audio::AudioConfig = "48000:FL,FR".parse().unwrap();
    let mut wire = Vec::new();
    proto::write_hello(&mut wire, &config.to_string()).unwrap();

    // The very first outbound bytes form the MISC hello frame.
    let frames = parse_wire(&wire);
    assert_eq!(frames.len(), 1);
    let (header, payload) = &frames[0];
    assert_eq!(header.frame_type, FrameType::Misc);
    assert_eq!(header.flags, flags::KEYFRAME);
    assert_eq!(header.latency_ms, 0);
    assert_eq!(header.size, 12);
    assert_eq!(payload.as_slice(), b"48000:FL,FR\0");
}

#[test]
fn uhid_create2_reassembled_from_three_chunks() {
    // 280-byte CREATE2 record (type + strings + ids, empty descriptor),
    // delivered as 50 + 100 + 130 bytes.
    let mut record = vec![0u8; 280];
    record[..4].copy_from_slice(&11u32.to_le_bytes()); // UHID_CREATE2
    record[4..12].copy_from_slice(b"lancast\0");

    let (rx, tx) = rustix::pipe::pipe().unwrap();
    let mut injector = UhidInjector::from_fd(tx);
    injector.handle_chunk(&record[..50]).unwrap();
    injector.handle_chunk(&record[50..150]).unwrap();
    injector.handle_chunk(&record[150..280]).unwrap();

    let mut written = vec![0u8; 4096];
    let count = rustix::io::read(&rx, &mut written).unwrap();
    written.truncate(count);
    assert_eq!(written, record, "exactly one atomic 280-byte write");
}
