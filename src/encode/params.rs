//! Codec parameter blocks shared by the encoder state machine, the NAL
//! packer and the hardware driver.
//!
//! These mirror the VA-API HEVC encode parameter buffers field-for-field
//! where the packer needs them, but stay plain Rust types so the state
//! machine and header emission can be exercised against a mock driver.

use crate::gpu::{Colorspace, Range};

/// Driver-side handle for an encode surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceId(pub u32);

impl SurfaceId {
    pub const INVALID: SurfaceId = SurfaceId(u32::MAX);
}

/// Reference picture flags used in [`PicRef`].
pub mod pic_flags {
    pub const INVALID: u32 = 0x0000_0001;
    pub const LONG_TERM_REFERENCE: u32 = 0x0000_0008;
    pub const RPS_ST_CURR_BEFORE: u32 = 0x0000_0010;
    pub const RPS_ST_CURR_AFTER: u32 = 0x0000_0020;
    pub const RPS_LT_CURR: u32 = 0x0000_0040;
}

/// One entry of a reference picture list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PicRef {
    pub surface: SurfaceId,
    pub poc: u32,
    pub flags: u32,
}

impl PicRef {
    pub const fn invalid() -> Self {
        Self {
            surface: SurfaceId::INVALID,
            poc: 0,
            flags: pic_flags::INVALID,
        }
    }
}

impl Default for PicRef {
    fn default() -> Self {
        Self::invalid()
    }
}

/// Sequence-level parameters, populated once at encoder construction.
#[derive(Debug, Clone)]
pub struct SeqParams {
    pub general_profile_idc: u8,
    pub general_level_idc: u8,
    pub general_tier_flag: bool,

    pub intra_idr_period: u32,
    pub ip_period: u32,

    /// Coded size, aligned up to the minimum coding block size.
    pub pic_width_in_luma_samples: u16,
    pub pic_height_in_luma_samples: u16,
    /// Requested size; the conformance window crops the coded size to it.
    pub crop_width: u32,
    pub crop_height: u32,

    pub chroma_format_idc: u8,
    pub separate_colour_plane: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,

    pub amp_enabled: bool,
    pub sample_adaptive_offset_enabled: bool,
    pub pcm_enabled: bool,
    pub temporal_mvp_enabled: bool,
    pub strong_intra_smoothing_enabled: bool,
    pub scaling_list_enabled: bool,

    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_luma_coding_block_size: u8,
    pub log2_min_transform_block_size_minus2: u8,
    pub log2_diff_max_min_transform_block_size: u8,
    pub max_transform_hierarchy_depth_inter: u8,
    pub max_transform_hierarchy_depth_intra: u8,

    /// Frame timing as a rational tick (num/den = seconds per frame).
    pub time_base_num: u32,
    pub time_base_den: u32,
    /// Depth of the B-frame pyramid; zero here (no B-frames).
    pub max_b_depth: u32,

    pub video_full_range: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coeffs: u8,
}

impl SeqParams {
    /// Colour description per H.265 Table E.3/E.4/E.5.
    pub fn colour_description(colorspace: Colorspace, range: Range) -> (bool, u8, u8, u8) {
        let full_range = matches!(range, Range::Full);
        match colorspace {
            // BT.601-6 625-line primaries and matrix.
            Colorspace::Bt601 => (full_range, 5, 6, 5),
            Colorspace::Bt709 => (full_range, 1, 1, 1),
        }
    }
}

/// Picture-level parameters. The constant part is a template populated at
/// construction; the per-frame fields are patched before each encode.
#[derive(Debug, Clone)]
pub struct PicParams {
    pub pic_init_qp: u8,
    pub diff_cu_qp_delta_depth: u8,
    pub pps_cb_qp_offset: i8,
    pub pps_cr_qp_offset: i8,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub slice_pic_parameter_set_id: u8,
    pub log2_parallel_merge_level_minus2: u8,
    pub collocated_ref_pic_index: u8,

    pub dependent_slice_segments_enabled: bool,
    pub sign_data_hiding_enabled: bool,
    pub constrained_intra_pred: bool,
    pub transform_skip_enabled: bool,
    pub cu_qp_delta_enabled: bool,
    pub weighted_pred: bool,
    pub weighted_bipred: bool,
    pub transquant_bypass_enabled: bool,
    pub tiles_enabled: bool,
    pub entropy_coding_sync_enabled: bool,
    pub loop_filter_across_slices_enabled: bool,
    pub scaling_list_data_present: bool,
    pub no_output_of_prior_pics: bool,

    // Patched per frame.
    pub nal_unit_type: u8,
    pub idr_pic: bool,
    /// 1 for intra pictures, 2 for predicted.
    pub coding_type: u8,
    pub reference_pic: bool,
    pub decoded_curr_pic: PicRef,
    pub reference_frames: [PicRef; 15],
}

/// One short-term reference picture set entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StRefPic {
    pub delta_poc_minus1: u32,
    pub used_by_curr_pic: bool,
}

/// Slice-level parameters, patched per frame.
#[derive(Debug, Clone)]
pub struct SliceParams {
    pub slice_type: u8,
    pub slice_pic_parameter_set_id: u8,
    pub num_ctu_in_slice: u32,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub max_num_merge_cand: u8,
    pub slice_qp_delta: i8,
    pub slice_cb_qp_offset: i8,
    pub slice_cr_qp_offset: i8,
    pub slice_beta_offset_div2: i8,
    pub slice_tc_offset_div2: i8,

    pub last_slice_of_pic: bool,
    pub dependent_slice_segment: bool,
    pub slice_temporal_mvp_enabled: bool,
    pub slice_sao_luma: bool,
    pub slice_sao_chroma: bool,
    pub num_ref_idx_active_override: bool,
    pub mvd_l1_zero: bool,
    pub cabac_init: bool,
    pub slice_deblocking_filter_disabled: bool,
    pub slice_loop_filter_across_slices_enabled: bool,
    pub collocated_from_l0: bool,

    pub ref_pic_list0: [PicRef; 15],
    pub ref_pic_list1: [PicRef; 15],

    // Slice segment header extras (not part of the VA slice buffer).
    pub first_slice_segment_in_pic: bool,
    pub pic_order_cnt_lsb: u32,
    pub negative_pics: Vec<StRefPic>,
    pub positive_pics: Vec<StRefPic>,
}

/// CQP rate control parameters uploaded as a misc buffer on IDR frames.
#[derive(Debug, Clone, Copy)]
pub struct RateControlParams {
    pub bits_per_second: u32,
    pub target_percentage: u32,
    pub window_size: u32,
    pub initial_qp: u32,
    pub min_qp: u32,
    pub max_qp: u32,
}

/// Frame rate misc parameter; `num / den` frames per second.
#[derive(Debug, Clone, Copy)]
pub struct FrameRateParams {
    pub num: u32,
    pub den: u32,
}

/// Which packed header kinds the driver accepts from user space.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedHeaderCaps {
    pub sequence: bool,
    pub slice: bool,
    pub misc: bool,
}

/// Subset of `VAConfigAttribEncHEVCFeatures` the encoder consumes. Each
/// flag is "the driver can encode with this tool enabled".
#[derive(Debug, Clone, Copy)]
pub struct HevcFeatureCaps {
    pub amp: bool,
    pub sample_adaptive_offset: bool,
    pub pcm: bool,
    pub temporal_mvp: bool,
    pub strong_intra_smoothing: bool,
    pub dependent_slices: bool,
    pub sign_data_hiding: bool,
    pub constrained_intra_pred: bool,
    pub transform_skip: bool,
    pub cu_qp_delta: bool,
    pub weighted_prediction: bool,
    pub transquant_bypass: bool,
}

impl HevcFeatureCaps {
    /// Defaults matching the Intel i965 Skylake driver, used when the
    /// driver does not report the attribute.
    pub fn i965_skylake() -> Self {
        Self {
            amp: true,
            sample_adaptive_offset: false,
            pcm: false,
            temporal_mvp: false,
            strong_intra_smoothing: false,
            dependent_slices: false,
            sign_data_hiding: false,
            constrained_intra_pred: false,
            transform_skip: false,
            cu_qp_delta: true,
            weighted_prediction: false,
            transquant_bypass: false,
        }
    }
}

/// CTB/TB size ranges from `VAConfigAttribEncHEVCBlockSizes`.
#[derive(Debug, Clone, Copy)]
pub struct HevcBlockSizeCaps {
    pub log2_max_coding_tree_block_size_minus3: u8,
    pub log2_min_coding_tree_block_size_minus3: u8,
    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_max_luma_transform_block_size_minus2: u8,
    pub log2_min_luma_transform_block_size_minus2: u8,
    pub max_max_transform_hierarchy_depth_inter: u8,
    pub max_max_transform_hierarchy_depth_intra: u8,
}

impl HevcBlockSizeCaps {
    /// i965 Skylake block geometry: 32x32 CTB, 8x8 CB, 4..32 TB, depth 3.
    pub fn i965_skylake() -> Self {
        Self {
            log2_max_coding_tree_block_size_minus3: 2,
            log2_min_coding_tree_block_size_minus3: 2,
            log2_min_luma_coding_block_size_minus3: 0,
            log2_max_luma_transform_block_size_minus2: 3,
            log2_min_luma_transform_block_size_minus2: 0,
            max_max_transform_hierarchy_depth_inter: 3,
            max_max_transform_hierarchy_depth_intra: 3,
        }
    }
}

/// Capability block probed once at driver construction.
#[derive(Debug, Clone, Copy)]
pub struct DriverCaps {
    pub packed_headers: PackedHeaderCaps,
    /// `None` when the driver does not report the attribute; the encoder
    /// then falls back to [`HevcFeatureCaps::i965_skylake`].
    pub features: Option<HevcFeatureCaps>,
    pub block_sizes: Option<HevcBlockSizeCaps>,
}
