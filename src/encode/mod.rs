//! Hardware HEVC encoding.
//!
//! [`Encoder`] owns the codec state machine (IDR cadence, picture order
//! counts, the reconstruction surface ring, packed header emission)
//! and talks to the hardware through the [`CodecDriver`] seam so the
//! whole state machine can be exercised against a mock. The VA-API
//! implementation of the seam lives in [`vaapi`].

pub mod bitstream;
pub mod hevc;
pub mod params;
pub mod sys;
pub mod vaapi;

use std::io::Write;
use std::time::Instant;

use crate::gpu::{Colorspace, Range};
use crate::proto::{self, FrameType};
use self::bitstream::Bitstream;
use self::params::{
    DriverCaps, FrameRateParams, HevcBlockSizeCaps, HevcFeatureCaps, PicParams, PicRef,
    RateControlParams, SeqParams, SliceParams, StRefPic, SurfaceId,
};

/// Distance between IDR frames. The original carries this constant with a
/// "where does this come from?" comment; it is a tunable, not derived.
pub const INTRA_IDR_PERIOD: u32 = 120;

/// Number of reconstruction surfaces; one in flight, one referenced.
pub const RECON_RING: usize = 2;

/// Minimum coding block size the coded picture is aligned to.
pub const MIN_CB_SIZE: u32 = 16;

/// CTU geometry used for `num_ctu_in_slice` (single-slice pictures).
const SLICE_BLOCK_SIZE: u32 = 32;

/// Fixed quantizer for CQP rate control.
const PIC_INIT_QP: u8 = 30;

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("encoder does not support {0}")]
    NotSupported(&'static str),
    #[error("{0}")]
    Driver(String),
    #[error("coded buffer returned multiple segments")]
    MultiSegment,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Packed header kinds handed to the driver for verbatim insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedHeaderKind {
    /// VPS + SPS + PPS, emitted once per IDR.
    Sequence,
    /// Slice segment header, emitted per frame.
    Slice,
}

/// Seam between the codec state machine and the hardware driver.
///
/// Uploads accumulate into the driver's pending frame; [`execute`] runs
/// the picture through the hardware and returns the coded access unit.
///
/// [`execute`]: CodecDriver::execute
pub trait CodecDriver {
    fn caps(&self) -> DriverCaps;
    fn input_surface(&self) -> SurfaceId;
    fn recon_surfaces(&self) -> &[SurfaceId];
    fn upload_sequence(&mut self, seq: &SeqParams) -> Result<(), EncoderError>;
    fn upload_rate_control(&mut self, rc: &RateControlParams) -> Result<(), EncoderError>;
    fn upload_frame_rate(&mut self, fr: &FrameRateParams) -> Result<(), EncoderError>;
    fn upload_picture(&mut self, pic: &PicParams) -> Result<(), EncoderError>;
    fn upload_slice(&mut self, slice: &SliceParams) -> Result<(), EncoderError>;
    fn upload_packed_header(
        &mut self,
        kind: PackedHeaderKind,
        header: &Bitstream,
    ) -> Result<(), EncoderError>;
    fn execute(&mut self) -> Result<Vec<u8>, EncoderError>;
}

/// HEVC encoder state machine over a [`CodecDriver`].
pub struct Encoder<D: CodecDriver> {
    driver: D,
    seq: SeqParams,
    pic: PicParams,
    slice: SliceParams,
    rc: RateControlParams,
    fr: FrameRateParams,
    frame_counter: u64,
}

impl<D: CodecDriver> Encoder<D> {
    /// Build parameter templates from the probed driver capabilities and
    /// validate once that every syntax branch they select is emittable.
    pub fn new(
        driver: D,
        width: u32,
        height: u32,
        colorspace: Colorspace,
        range: Range,
    ) -> Result<Self, EncoderError> {
        let caps = driver.caps();
        let features = caps.features.unwrap_or_else(HevcFeatureCaps::i965_skylake);
        let blocks = caps.block_sizes.unwrap_or_else(HevcBlockSizeCaps::i965_skylake);

        let coded_width = width.div_ceil(MIN_CB_SIZE) * MIN_CB_SIZE;
        let coded_height = height.div_ceil(MIN_CB_SIZE) * MIN_CB_SIZE;
        let (full_range, primaries, transfer, matrix) =
            SeqParams::colour_description(colorspace, range);

        let seq = SeqParams {
            general_profile_idc: 1, // Main profile
            general_level_idc: 120, // Level 4
            general_tier_flag: false,
            intra_idr_period: INTRA_IDR_PERIOD,
            ip_period: 1, // no B-frames
            pic_width_in_luma_samples: coded_width as u16,
            pic_height_in_luma_samples: coded_height as u16,
            crop_width: width,
            crop_height: height,
            chroma_format_idc: 1, // 4:2:0
            separate_colour_plane: false,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            amp_enabled: features.amp,
            sample_adaptive_offset_enabled: features.sample_adaptive_offset,
            pcm_enabled: false,
            temporal_mvp_enabled: features.temporal_mvp,
            strong_intra_smoothing_enabled: features.strong_intra_smoothing,
            scaling_list_enabled: false,
            log2_min_luma_coding_block_size_minus3: blocks.log2_min_luma_coding_block_size_minus3,
            log2_diff_max_min_luma_coding_block_size: blocks
                .log2_max_coding_tree_block_size_minus3
                .saturating_sub(blocks.log2_min_luma_coding_block_size_minus3),
            log2_min_transform_block_size_minus2: blocks.log2_min_luma_transform_block_size_minus2,
            log2_diff_max_min_transform_block_size: blocks
                .log2_max_luma_transform_block_size_minus2
                .saturating_sub(blocks.log2_min_luma_transform_block_size_minus2),
            max_transform_hierarchy_depth_inter: blocks.max_max_transform_hierarchy_depth_inter,
            max_transform_hierarchy_depth_intra: blocks.max_max_transform_hierarchy_depth_intra,
            time_base_num: 1,
            time_base_den: 60,
            max_b_depth: 0,
            video_full_range: full_range,
            colour_primaries: primaries,
            transfer_characteristics: transfer,
            matrix_coeffs: matrix,
        };

        let pic = PicParams {
            pic_init_qp: PIC_INIT_QP,
            diff_cu_qp_delta_depth: 0,
            pps_cb_qp_offset: 0,
            pps_cr_qp_offset: 0,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            slice_pic_parameter_set_id: 0,
            log2_parallel_merge_level_minus2: 0,
            collocated_ref_pic_index: if features.temporal_mvp { 0 } else { 0xff },
            dependent_slice_segments_enabled: false,
            sign_data_hiding_enabled: features.sign_data_hiding,
            constrained_intra_pred: false,
            transform_skip_enabled: features.transform_skip,
            cu_qp_delta_enabled: features.cu_qp_delta,
            weighted_pred: false,
            weighted_bipred: false,
            transquant_bypass_enabled: false,
            tiles_enabled: false,
            entropy_coding_sync_enabled: false,
            loop_filter_across_slices_enabled: true,
            scaling_list_data_present: false,
            no_output_of_prior_pics: false,
            nal_unit_type: hevc::NUT_IDR_W_RADL,
            idr_pic: true,
            coding_type: 1,
            reference_pic: true,
            decoded_curr_pic: PicRef::invalid(),
            reference_frames: [PicRef::invalid(); 15],
        };

        let ctu_cols = coded_width.div_ceil(SLICE_BLOCK_SIZE);
        let ctu_rows = coded_height.div_ceil(SLICE_BLOCK_SIZE);
        let slice = SliceParams {
            slice_type: hevc::SLICE_TYPE_I,
            slice_pic_parameter_set_id: 0,
            num_ctu_in_slice: ctu_cols * ctu_rows,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            max_num_merge_cand: 5,
            slice_qp_delta: 0,
            slice_cb_qp_offset: 0,
            slice_cr_qp_offset: 0,
            slice_beta_offset_div2: 0,
            slice_tc_offset_div2: 0,
            last_slice_of_pic: true,
            dependent_slice_segment: false,
            slice_temporal_mvp_enabled: seq.temporal_mvp_enabled,
            slice_sao_luma: seq.sample_adaptive_offset_enabled,
            slice_sao_chroma: seq.sample_adaptive_offset_enabled,
            num_ref_idx_active_override: false,
            mvd_l1_zero: false,
            cabac_init: false,
            slice_deblocking_filter_disabled: false,
            slice_loop_filter_across_slices_enabled: false,
            collocated_from_l0: false,
            ref_pic_list0: [PicRef::invalid(); 15],
            ref_pic_list1: [PicRef::invalid(); 15],
            first_slice_segment_in_pic: true,
            pic_order_cnt_lsb: 0,
            negative_pics: Vec::new(),
            positive_pics: Vec::new(),
        };

        hevc::validate(&seq, &pic)?;
        if driver.recon_surfaces().len() < RECON_RING {
            return Err(EncoderError::NotSupported("reconstruction surface ring"));
        }

        Ok(Self {
            driver,
            seq,
            pic,
            slice,
            rc: RateControlParams {
                bits_per_second: 0,
                target_percentage: 100,
                window_size: 1000,
                initial_qp: 0,
                min_qp: 0,
                max_qp: 0,
            },
            fr: FrameRateParams { num: 60, den: 1 },
            frame_counter: 0,
        })
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Encode the current contents of the input surface and write the
    /// coded access unit as a VIDEO wire frame.
    ///
    /// `capture_start` is the capture-callback entry time; the elapsed
    /// time just before the socket write becomes the latency hint. The
    /// frame counter only advances when the frame made it out, so a
    /// failed tick never perturbs the IDR cadence or POC sequence.
    pub fn encode_frame<W: Write>(
        &mut self,
        out: &mut W,
        capture_start: Instant,
    ) -> Result<(), EncoderError> {
        let period = u64::from(self.seq.intra_idr_period);
        let is_idr = self.frame_counter % period == 0;
        let poc = (self.frame_counter % period) as u32;
        let caps = self.driver.caps();

        let ring = self.driver.recon_surfaces().to_vec();
        let recon = ring[self.frame_counter as usize % ring.len()];

        self.pic.decoded_curr_pic = PicRef {
            surface: recon,
            poc,
            flags: 0,
        };
        self.pic.reference_frames = [PicRef::invalid(); 15];
        if is_idr {
            self.pic.nal_unit_type = hevc::NUT_IDR_W_RADL;
            self.pic.idr_pic = true;
            self.pic.coding_type = 1;
        } else {
            let prev = PicRef {
                surface: ring[(self.frame_counter - 1) as usize % ring.len()],
                poc: ((self.frame_counter - 1) % period) as u32,
                flags: params::pic_flags::RPS_ST_CURR_BEFORE,
            };
            self.pic.reference_frames[0] = prev;
            self.pic.nal_unit_type = hevc::NUT_TRAIL_R;
            self.pic.idr_pic = false;
            self.pic.coding_type = 2;
        }
        self.pic.reference_pic = true;

        self.slice.slice_type = if is_idr {
            hevc::SLICE_TYPE_I
        } else {
            hevc::SLICE_TYPE_P
        };
        self.slice.pic_order_cnt_lsb = poc & hevc::PIC_ORDER_CNT_LSB_MASK;
        self.slice.ref_pic_list0 = [PicRef::invalid(); 15];
        self.slice.negative_pics.clear();
        if !is_idr {
            self.slice.ref_pic_list0[0] = self.pic.reference_frames[0];
            self.slice.negative_pics.push(StRefPic {
                delta_poc_minus1: 0,
                used_by_curr_pic: true,
            });
        }

        if is_idr {
            self.driver.upload_sequence(&self.seq)?;
            self.driver.upload_rate_control(&self.rc)?;
            self.driver.upload_frame_rate(&self.fr)?;
        }
        self.driver.upload_picture(&self.pic)?;
        if is_idr && caps.packed_headers.sequence {
            let mut bs = Bitstream::new();
            hevc::pack_video_parameter_set(&mut bs, &self.seq);
            hevc::pack_seq_parameter_set(&mut bs, &self.seq);
            hevc::pack_pic_parameter_set(&mut bs, &self.pic);
            self.driver
                .upload_packed_header(PackedHeaderKind::Sequence, &bs)?;
        }
        if caps.packed_headers.slice {
            let mut bs = Bitstream::new();
            hevc::pack_slice_segment_header(&mut bs, &self.seq, &self.pic, &self.slice);
            self.driver
                .upload_packed_header(PackedHeaderKind::Slice, &bs)?;
        }
        self.driver.upload_slice(&self.slice)?;

        let coded = self.driver.execute()?;

        let latency_ms = (capture_start.elapsed().as_micros() / 1000).min(u128::from(u16::MAX));
        let flags = if is_idr { proto::flags::KEYFRAME } else { 0 };
        proto::write_frame(out, FrameType::Video, flags, latency_ms as u16, &coded)?;

        self.frame_counter += 1;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver {
        caps: DriverCaps,
        surfaces: Vec<SurfaceId>,
    }

    impl NullDriver {
        fn new() -> Self {
            Self {
                caps: DriverCaps {
                    packed_headers: params::PackedHeaderCaps {
                        sequence: true,
                        slice: true,
                        misc: false,
                    },
                    features: None,
                    block_sizes: None,
                },
                surfaces: vec![SurfaceId(1), SurfaceId(2)],
            }
        }
    }

    impl CodecDriver for NullDriver {
        fn caps(&self) -> DriverCaps {
            self.caps
        }
        fn input_surface(&self) -> SurfaceId {
            SurfaceId(0)
        }
        fn recon_surfaces(&self) -> &[SurfaceId] {
            &self.surfaces
        }
        fn upload_sequence(&mut self, _: &SeqParams) -> Result<(), EncoderError> {
            Ok(())
        }
        fn upload_rate_control(&mut self, _: &RateControlParams) -> Result<(), EncoderError> {
            Ok(())
        }
        fn upload_frame_rate(&mut self, _: &FrameRateParams) -> Result<(), EncoderError> {
            Ok(())
        }
        fn upload_picture(&mut self, _: &PicParams) -> Result<(), EncoderError> {
            Ok(())
        }
        fn upload_slice(&mut self, _: &SliceParams) -> Result<(), EncoderError> {
            Ok(())
        }
        fn upload_packed_header(
            &mut self,
            _: PackedHeaderKind,
            _: &Bitstream,
        ) -> Result<(), EncoderError> {
            Ok(())
        }
        fn execute(&mut self) -> Result<Vec<u8>, EncoderError> {
            Ok(vec![0, 0, 0, 1, 0x28, 0x01])
        }
    }

    #[test]
    fn test_coded_size_alignment() {
        let enc = Encoder::new(
            NullDriver::new(),
            1920,
            1080,
            Colorspace::Bt709,
            Range::Narrow,
        )
        .unwrap();
        assert_eq!(enc.seq.pic_width_in_luma_samples, 1920);
        assert_eq!(enc.seq.pic_height_in_luma_samples, 1088);
        assert_eq!(enc.seq.crop_height, 1080);
    }

    #[test]
    fn test_caps_fall_back_to_i965_defaults() {
        let enc = Encoder::new(
            NullDriver::new(),
            640,
            480,
            Colorspace::Bt601,
            Range::Full,
        )
        .unwrap();
        assert!(enc.seq.amp_enabled);
        assert!(!enc.seq.sample_adaptive_offset_enabled);
        assert_eq!(enc.seq.log2_diff_max_min_luma_coding_block_size, 2);
        assert!(enc.seq.video_full_range);
        assert_eq!(enc.seq.matrix_coeffs, 5);
    }

    #[test]
    fn test_single_recon_surface_rejected() {
        let mut driver = NullDriver::new();
        driver.surfaces.truncate(1);
        assert!(matches!(
            Encoder::new(driver, 640, 480, Colorspace::Bt709, Range::Narrow),
            Err(EncoderError::NotSupported(_))
        ));
    }

    #[test]
    fn test_counter_does_not_advance_on_driver_error() {
        struct FailingDriver(NullDriver);
        impl CodecDriver for FailingDriver {
            fn caps(&self) -> DriverCaps {
                self.0.caps()
            }
            fn input_surface(&self) -> SurfaceId {
                self.0.input_surface()
            }
            fn recon_surfaces(&self) -> &[SurfaceId] {
                self.0.recon_surfaces()
            }
            fn upload_sequence(&mut self, s: &SeqParams) -> Result<(), EncoderError> {
                self.0.upload_sequence(s)
            }
            fn upload_rate_control(&mut self, r: &RateControlParams) -> Result<(), EncoderError> {
                self.0.upload_rate_control(r)
            }
            fn upload_frame_rate(&mut self, f: &FrameRateParams) -> Result<(), EncoderError> {
                self.0.upload_frame_rate(f)
            }
            fn upload_picture(&mut self, p: &PicParams) -> Result<(), EncoderError> {
                self.0.upload_picture(p)
            }
            fn upload_slice(&mut self, s: &SliceParams) -> Result<(), EncoderError> {
                self.0.upload_slice(s)
            }
            fn upload_packed_header(
                &mut self,
                k: PackedHeaderKind,
                h: &Bitstream,
            ) -> Result<(), EncoderError> {
                self.0.upload_packed_header(k, h)
            }
            fn execute(&mut self) -> Result<Vec<u8>, EncoderError> {
                Err(EncoderError::Driver("hardware hiccup".into()))
            }
        }

        let mut enc = Encoder::new(
            FailingDriver(NullDriver::new()),
            640,
            480,
            Colorspace::Bt709,
            Range::Narrow,
        )
        .unwrap();
        let mut sink = Vec::new();
        assert!(enc.encode_frame(&mut sink, Instant::now()).is_err());
        assert_eq!(enc.frame_counter(), 0);
        assert!(sink.is_empty());

        assert!(enc.encode_frame(&mut sink, Instant::now()).is_err());
        assert_eq!(enc.frame_counter(), 0);
    }
}
