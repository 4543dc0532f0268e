//! HEVC parameter set and slice segment header emission (ITU-T H.265).
//!
//! Emits raw RBSP bits; emulation prevention bytes are inserted by the
//! encoder driver, which is told so via `has_emulation_bytes` on the
//! packed header descriptor. Section references below are to H.265 (2021).

use super::bitstream::Bitstream;
use super::params::{PicParams, SeqParams, SliceParams};
use super::EncoderError;

// Table 7-1
pub const NUT_TRAIL_R: u8 = 1;
pub const NUT_BLA_W_LP: u8 = 16;
pub const NUT_IDR_W_RADL: u8 = 19;
pub const NUT_IDR_N_LP: u8 = 20;
pub const NUT_RSV_IRAP_VCL23: u8 = 23;
pub const NUT_VPS: u8 = 32;
pub const NUT_SPS: u8 = 33;
pub const NUT_PPS: u8 = 34;

// Table 7-7
pub const SLICE_TYPE_B: u8 = 0;
pub const SLICE_TYPE_P: u8 = 1;
pub const SLICE_TYPE_I: u8 = 2;

// Hardcoded across all emitted bitstreams; only the branches these select
// are implemented, which `validate` checks once at encoder construction.
const LOG2_MAX_PIC_ORDER_CNT_LSB_MINUS4: u32 = 8;
const NUM_EXTRA_SLICE_HEADER_BITS: u32 = 0;
const NUM_SHORT_TERM_REF_PIC_SETS: u32 = 0;

/// Number of bits of `slice_pic_order_cnt_lsb` in the slice header.
pub const PIC_ORDER_CNT_LSB_BITS: u32 = LOG2_MAX_PIC_ORDER_CNT_LSB_MINUS4 + 4;

/// Mask applied to the picture order count before header emission.
pub const PIC_ORDER_CNT_LSB_MASK: u32 = (1 << PIC_ORDER_CNT_LSB_BITS) - 1;

/// Reject parameter combinations whose syntax branches are not emitted.
///
/// The packers below assume the fixed-function subset a CQP low-delay
/// stream uses; anything outside it would require header syntax this
/// module does not produce.
pub fn validate(seq: &SeqParams, pic: &PicParams) -> Result<(), EncoderError> {
    let unsupported = |what: &'static str| Err(EncoderError::NotSupported(what));
    if seq.general_profile_idc != 1 && seq.general_profile_idc != 2 {
        return unsupported("general_profile_idc outside Main/Main10");
    }
    if seq.chroma_format_idc != 1 || seq.separate_colour_plane {
        return unsupported("chroma format other than 4:2:0");
    }
    if seq.scaling_list_enabled || pic.scaling_list_data_present {
        return unsupported("scaling lists");
    }
    if seq.pcm_enabled {
        return unsupported("PCM coding blocks");
    }
    if seq.max_b_depth != 0 {
        return unsupported("B-frame reordering");
    }
    if pic.tiles_enabled {
        return unsupported("tiles");
    }
    if pic.weighted_pred || pic.weighted_bipred {
        return unsupported("weighted prediction tables");
    }
    Ok(())
}

// 7.3.1.2 NAL unit header, preceded by a 4-byte Annex B start code.
fn pack_nal_unit_header(bs: &mut Bitstream, nal_unit_type: u8) {
    bs.append(32, 0x0000_0001);
    bs.append(1, 0); // forbidden_zero_bit
    bs.append(6, u32::from(nal_unit_type));
    bs.append(6, 0); // nuh_layer_id
    bs.append(3, 1); // nuh_temporal_id_plus1
}

// 7.3.3 Profile, tier and level.
fn pack_profile_tier_level(bs: &mut Bitstream, seq: &SeqParams) {
    bs.append(2, 0); // general_profile_space
    bs.append(1, seq.general_tier_flag.into());
    bs.append(5, u32::from(seq.general_profile_idc));

    // Compatibility flag deduction: the profile itself, Main for Main10,
    // and both for Main Still Picture.
    let mut compat = [false; 32];
    compat[seq.general_profile_idc as usize] = true;
    if compat[1] {
        compat[2] = true;
    }
    if compat[3] {
        compat[1] = true;
        compat[2] = true;
    }
    for flag in compat {
        bs.append(1, flag.into());
    }

    bs.append(1, 1); // general_progressive_source_flag
    bs.append(1, 0); // general_interlaced_source_flag
    bs.append(1, 1); // general_non_packed_constraint_flag
    bs.append(1, 1); // general_frame_only_constraint_flag
    if seq.general_profile_idc == 2 || compat[2] {
        bs.append(7, 0); // general_reserved_zero_7bits
        bs.append(1, 0); // general_one_picture_only_constraint_flag
        bs.append(24, 0); // general_reserved_zero_35bits
        bs.append(11, 0);
    } else {
        bs.append(24, 0); // general_reserved_zero_43bits
        bs.append(19, 0);
    }
    // Main/Main10 carry general_inbld_flag; there is no INBLD use here.
    bs.append(1, 0);

    bs.append(8, u32::from(seq.general_level_idc));
}

// 7.3.2.11 RBSP trailing bits.
fn pack_rbsp_trailing_bits(bs: &mut Bitstream) {
    bs.append(1, 1); // rbsp_stop_one_bit
    bs.byte_align(); // rbsp_alignment_zero_bit
}

/// 7.3.2.1 Video parameter set RBSP.
pub fn pack_video_parameter_set(bs: &mut Bitstream, seq: &SeqParams) {
    pack_nal_unit_header(bs, NUT_VPS);

    let mut rbsp = Bitstream::new();
    rbsp.append(4, 0); // vps_video_parameter_set_id
    rbsp.append(1, 1); // vps_base_layer_internal_flag
    rbsp.append(1, 1); // vps_base_layer_available_flag
    rbsp.append(6, 0); // vps_max_layers_minus1
    rbsp.append(3, 0); // vps_max_sub_layers_minus1
    rbsp.append(1, 1); // vps_temporal_id_nesting_flag
    rbsp.append(16, 0xffff); // vps_reserved_0xffff_16bits

    pack_profile_tier_level(&mut rbsp, seq);

    rbsp.append(1, 0); // vps_sub_layer_ordering_info_present_flag
    rbsp.append_ue(seq.max_b_depth + 1); // vps_max_dec_pic_buffering_minus1
    rbsp.append_ue(seq.max_b_depth); // vps_max_num_reorder_pics
    rbsp.append_ue(0); // vps_max_latency_increase_plus1

    rbsp.append(6, 0); // vps_max_layer_id
    rbsp.append_ue(0); // vps_num_layer_sets_minus1

    rbsp.append(1, 1); // vps_timing_info_present_flag
    rbsp.append(32, seq.time_base_num); // vps_num_units_in_tick
    rbsp.append(32, seq.time_base_den); // vps_time_scale
    rbsp.append(1, 0); // vps_poc_proportional_to_timing_flag
    rbsp.append_ue(0); // vps_num_hrd_parameters

    rbsp.append(1, 0); // vps_extension_flag
    pack_rbsp_trailing_bits(&mut rbsp);
    bs.extend(&rbsp);
}

// E.2.1 VUI parameters.
fn pack_vui_parameters(bs: &mut Bitstream, seq: &SeqParams) {
    bs.append(1, 0); // aspect_ratio_info_present_flag
    bs.append(1, 0); // overscan_info_present_flag

    bs.append(1, 1); // video_signal_type_present_flag
    bs.append(3, 5); // video_format: unspecified
    bs.append(1, seq.video_full_range.into());
    bs.append(1, 1); // colour_description_present_flag
    bs.append(8, u32::from(seq.colour_primaries));
    bs.append(8, u32::from(seq.transfer_characteristics));
    bs.append(8, u32::from(seq.matrix_coeffs));

    bs.append(1, 0); // chroma_loc_info_present_flag
    bs.append(1, 0); // neutral_chroma_indication_flag
    bs.append(1, 0); // field_seq_flag
    bs.append(1, 0); // frame_field_info_present_flag
    bs.append(1, 0); // default_display_window_flag

    bs.append(1, 1); // vui_timing_info_present_flag
    bs.append(32, seq.time_base_num); // vui_num_units_in_tick
    bs.append(32, seq.time_base_den); // vui_time_scale
    bs.append(1, 0); // vui_poc_proportional_to_timing_flag
    bs.append(1, 0); // vui_hrd_parameters_present_flag

    bs.append(1, 1); // bitstream_restriction_flag
    bs.append(1, 0); // tiles_fixed_structure_flag
    bs.append(1, 1); // motion_vectors_over_pic_boundaries_flag
    bs.append(1, 1); // restricted_ref_pic_lists_flag
    bs.append_ue(0); // min_spatial_segmentation_idc
    bs.append_ue(0); // max_bytes_per_pic_denom
    bs.append_ue(0); // max_bits_per_min_cu_denom
    bs.append_ue(15); // log2_max_mv_length_horizontal
    bs.append_ue(15); // log2_max_mv_length_vertical
}

/// 7.3.2.2 Sequence parameter set RBSP.
pub fn pack_seq_parameter_set(bs: &mut Bitstream, seq: &SeqParams) {
    pack_nal_unit_header(bs, NUT_SPS);

    let mut rbsp = Bitstream::new();
    rbsp.append(4, 0); // sps_video_parameter_set_id
    rbsp.append(3, 0); // sps_max_sub_layers_minus1
    rbsp.append(1, 1); // sps_temporal_id_nesting_flag

    pack_profile_tier_level(&mut rbsp, seq);

    rbsp.append_ue(0); // sps_seq_parameter_set_id
    rbsp.append_ue(u32::from(seq.chroma_format_idc));
    rbsp.append_ue(u32::from(seq.pic_width_in_luma_samples));
    rbsp.append_ue(u32::from(seq.pic_height_in_luma_samples));

    let coded_w = u32::from(seq.pic_width_in_luma_samples);
    let coded_h = u32::from(seq.pic_height_in_luma_samples);
    if seq.crop_width != coded_w || seq.crop_height != coded_h {
        // Offsets are in chroma samples; only right/bottom crop happens.
        rbsp.append(1, 1); // conformance_window_flag
        rbsp.append_ue(0); // conf_win_left_offset
        rbsp.append_ue((coded_w - seq.crop_width) / 2);
        rbsp.append_ue(0); // conf_win_top_offset
        rbsp.append_ue((coded_h - seq.crop_height) / 2);
    } else {
        rbsp.append(1, 0); // conformance_window_flag
    }

    rbsp.append_ue(u32::from(seq.bit_depth_luma_minus8));
    rbsp.append_ue(u32::from(seq.bit_depth_chroma_minus8));
    rbsp.append_ue(LOG2_MAX_PIC_ORDER_CNT_LSB_MINUS4);

    rbsp.append(1, 0); // sps_sub_layer_ordering_info_present_flag
    rbsp.append_ue(seq.max_b_depth + 1); // sps_max_dec_pic_buffering_minus1
    rbsp.append_ue(seq.max_b_depth); // sps_max_num_reorder_pics
    rbsp.append_ue(0); // sps_max_latency_increase_plus1

    rbsp.append_ue(u32::from(seq.log2_min_luma_coding_block_size_minus3));
    rbsp.append_ue(u32::from(seq.log2_diff_max_min_luma_coding_block_size));
    rbsp.append_ue(u32::from(seq.log2_min_transform_block_size_minus2));
    rbsp.append_ue(u32::from(seq.log2_diff_max_min_transform_block_size));
    rbsp.append_ue(u32::from(seq.max_transform_hierarchy_depth_inter));
    rbsp.append_ue(u32::from(seq.max_transform_hierarchy_depth_intra));

    rbsp.append(1, seq.scaling_list_enabled.into());
    rbsp.append(1, seq.amp_enabled.into());
    rbsp.append(1, seq.sample_adaptive_offset_enabled.into());
    rbsp.append(1, seq.pcm_enabled.into());

    rbsp.append_ue(NUM_SHORT_TERM_REF_PIC_SETS);
    rbsp.append(1, 0); // long_term_ref_pics_present_flag

    rbsp.append(1, seq.temporal_mvp_enabled.into());
    rbsp.append(1, seq.strong_intra_smoothing_enabled.into());

    rbsp.append(1, 1); // vui_parameters_present_flag
    pack_vui_parameters(&mut rbsp, seq);

    rbsp.append(1, 0); // sps_extension_present_flag
    pack_rbsp_trailing_bits(&mut rbsp);
    bs.extend(&rbsp);
}

/// 7.3.2.3.1 General picture parameter set RBSP.
pub fn pack_pic_parameter_set(bs: &mut Bitstream, pic: &PicParams) {
    pack_nal_unit_header(bs, NUT_PPS);

    let mut rbsp = Bitstream::new();
    rbsp.append_ue(0); // pps_pic_parameter_set_id
    rbsp.append_ue(0); // pps_seq_parameter_set_id
    rbsp.append(1, pic.dependent_slice_segments_enabled.into());
    rbsp.append(1, 0); // output_flag_present_flag
    rbsp.append(3, NUM_EXTRA_SLICE_HEADER_BITS);
    rbsp.append(1, pic.sign_data_hiding_enabled.into());
    rbsp.append(1, 0); // cabac_init_present_flag
    rbsp.append_ue(u32::from(pic.num_ref_idx_l0_default_active_minus1));
    rbsp.append_ue(u32::from(pic.num_ref_idx_l1_default_active_minus1));
    rbsp.append_se(i32::from(pic.pic_init_qp) - 26); // init_qp_minus26
    rbsp.append(1, pic.constrained_intra_pred.into());
    rbsp.append(1, pic.transform_skip_enabled.into());
    rbsp.append(1, pic.cu_qp_delta_enabled.into());
    if pic.cu_qp_delta_enabled {
        rbsp.append_ue(u32::from(pic.diff_cu_qp_delta_depth));
    }
    rbsp.append_se(i32::from(pic.pps_cb_qp_offset));
    rbsp.append_se(i32::from(pic.pps_cr_qp_offset));
    rbsp.append(1, 0); // pps_slice_chroma_qp_offsets_present_flag
    rbsp.append(1, pic.weighted_pred.into());
    rbsp.append(1, pic.weighted_bipred.into());
    rbsp.append(1, pic.transquant_bypass_enabled.into());
    rbsp.append(1, pic.tiles_enabled.into());
    rbsp.append(1, pic.entropy_coding_sync_enabled.into());
    rbsp.append(1, pic.loop_filter_across_slices_enabled.into());
    rbsp.append(1, 0); // deblocking_filter_control_present_flag
    rbsp.append(1, pic.scaling_list_data_present.into());
    rbsp.append(1, 0); // lists_modification_present_flag
    rbsp.append_ue(u32::from(pic.log2_parallel_merge_level_minus2));
    rbsp.append(1, 0); // slice_segment_header_extension_present_flag
    rbsp.append(1, 0); // pps_extension_present_flag

    pack_rbsp_trailing_bits(&mut rbsp);
    bs.extend(&rbsp);
}

// 7.3.7 Short-term reference picture set, inline in the slice header
// (st_ref_pic_set_sps_flag is always zero here).
fn pack_st_ref_pic_set(bs: &mut Bitstream, st_rps_idx: u32, slice: &SliceParams) {
    if st_rps_idx != 0 {
        bs.append(1, 0); // inter_ref_pic_set_prediction_flag
    }
    bs.append_ue(slice.negative_pics.len() as u32);
    bs.append_ue(slice.positive_pics.len() as u32);
    for pic in &slice.negative_pics {
        bs.append_ue(pic.delta_poc_minus1); // delta_poc_s0_minus1
        bs.append(1, pic.used_by_curr_pic.into());
    }
    for pic in &slice.positive_pics {
        bs.append_ue(pic.delta_poc_minus1); // delta_poc_s1_minus1
        bs.append(1, pic.used_by_curr_pic.into());
    }
}

/// 7.3.6.1 General slice segment header.
///
/// Unlike the parameter sets this is not a complete RBSP (the driver
/// appends the slice payload), so it ends with the 7.3.2.12
/// byte_alignment() structure instead of RBSP trailing bits.
pub fn pack_slice_segment_header(
    bs: &mut Bitstream,
    seq: &SeqParams,
    pic: &PicParams,
    slice: &SliceParams,
) {
    pack_nal_unit_header(bs, pic.nal_unit_type);

    bs.append(1, slice.first_slice_segment_in_pic.into());
    if (NUT_BLA_W_LP..=NUT_RSV_IRAP_VCL23).contains(&pic.nal_unit_type) {
        bs.append(1, pic.no_output_of_prior_pics.into());
    }
    bs.append_ue(u32::from(slice.slice_pic_parameter_set_id));

    debug_assert!(slice.first_slice_segment_in_pic, "single-slice pictures only");
    if !slice.dependent_slice_segment {
        bs.append_ue(u32::from(slice.slice_type));
        if pic.nal_unit_type != NUT_IDR_W_RADL && pic.nal_unit_type != NUT_IDR_N_LP {
            bs.append(
                PIC_ORDER_CNT_LSB_BITS,
                slice.pic_order_cnt_lsb & PIC_ORDER_CNT_LSB_MASK,
            );
            bs.append(1, 0); // short_term_ref_pic_set_sps_flag
            pack_st_ref_pic_set(bs, NUM_SHORT_TERM_REF_PIC_SETS, slice);
            if seq.temporal_mvp_enabled {
                bs.append(1, slice.slice_temporal_mvp_enabled.into());
            }
        }
        if seq.sample_adaptive_offset_enabled {
            bs.append(1, slice.slice_sao_luma.into());
            // ChromaArrayType equals chroma_format_idc without separate planes.
            if seq.chroma_format_idc != 0 {
                bs.append(1, slice.slice_sao_chroma.into());
            }
        }
        if slice.slice_type == SLICE_TYPE_P || slice.slice_type == SLICE_TYPE_B {
            bs.append(1, slice.num_ref_idx_active_override.into());
            if slice.num_ref_idx_active_override {
                bs.append_ue(u32::from(slice.num_ref_idx_l0_active_minus1));
                if slice.slice_type == SLICE_TYPE_B {
                    bs.append_ue(u32::from(slice.num_ref_idx_l1_active_minus1));
                }
            }
            if slice.slice_type == SLICE_TYPE_B {
                bs.append(1, slice.mvd_l1_zero.into());
            }
            if slice.slice_temporal_mvp_enabled {
                if slice.slice_type == SLICE_TYPE_B {
                    bs.append(1, slice.collocated_from_l0.into());
                }
                if (slice.collocated_from_l0 && slice.num_ref_idx_l0_active_minus1 > 0)
                    || (!slice.collocated_from_l0 && slice.num_ref_idx_l1_active_minus1 > 0)
                {
                    bs.append_ue(u32::from(pic.collocated_ref_pic_index));
                }
            }
            bs.append_ue(u32::from(5 - slice.max_num_merge_cand)); // five_minus_max_num_merge_cand
        }
        bs.append_se(i32::from(slice.slice_qp_delta));
        if pic.loop_filter_across_slices_enabled
            && (slice.slice_sao_luma
                || slice.slice_sao_chroma
                || !slice.slice_deblocking_filter_disabled)
        {
            bs.append(1, slice.slice_loop_filter_across_slices_enabled.into());
        }
    }

    // Below is the byte_alignment() structure.
    bs.append(1, 1); // alignment_bit_equal_to_one
    bs.byte_align(); // alignment_bit_equal_to_zero
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::bitstream::testing::BitReader;
    use crate::encode::params::{PicRef, StRefPic};
    use crate::encode::test_params;

    fn nal_header_bytes(data: &[u8]) -> (u8, u8) {
        assert_eq!(&data[..4], &[0, 0, 0, 1], "missing start code");
        (data[4], data[5])
    }

    /// Walk a profile_tier_level for Main profile and return the level.
    fn read_profile_tier_level(reader: &mut BitReader<'_>) -> u32 {
        assert_eq!(reader.read(2), 0, "general_profile_space");
        assert!(!reader.read_flag(), "general_tier_flag");
        assert_eq!(reader.read(5), 1, "general_profile_idc");
        // Compatibility: Main implies Main Still Picture, so bits 1 and
        // 2 are set (MSB-first, bit j for profile j).
        assert_eq!(reader.read(32), (1 << 30) | (1 << 29));
        assert!(reader.read_flag(), "general_progressive_source_flag");
        assert!(!reader.read_flag(), "general_interlaced_source_flag");
        assert!(reader.read_flag(), "general_non_packed_constraint_flag");
        assert!(reader.read_flag(), "general_frame_only_constraint_flag");
        // Main is Still-Picture-compatible: 7 reserved bits, the
        // one-picture-only flag, then 35 reserved bits.
        assert_eq!(reader.read(7), 0);
        assert!(!reader.read_flag(), "general_one_picture_only_constraint_flag");
        assert_eq!(reader.read(24), 0);
        assert_eq!(reader.read(11), 0);
        assert!(!reader.read_flag(), "general_inbld_flag");
        reader.read(8) // general_level_idc
    }

    #[test]
    fn test_vps_shape() {
        let seq = test_params::seq_1080p();
        let mut bs = Bitstream::new();
        pack_video_parameter_set(&mut bs, &seq);
        assert_eq!(bs.bit_len() % 8, 0);
        let (b0, b1) = nal_header_bytes(bs.data());
        assert_eq!(b0, NUT_VPS << 1);
        assert_eq!(b1, 1);
        // vps_video_parameter_set_id(4) + base layer flags(2) +
        // max_layers(6) -> 0x0c, then sub layers + nesting + reserved.
        assert_eq!(bs.data()[6] >> 4, 0x0);
    }

    #[test]
    fn test_sps_conformance_window() {
        // 1920x1080 pads to 1920x1088: expect a bottom crop of 4 chroma rows.
        let seq = test_params::seq_1080p();
        let mut bs = Bitstream::new();
        pack_seq_parameter_set(&mut bs, &seq);
        assert_eq!(bs.bit_len() % 8, 0);
        let (b0, _) = nal_header_bytes(bs.data());
        assert_eq!(b0, NUT_SPS << 1);

        // An aligned size must not emit the conformance window.
        let mut aligned = seq.clone();
        aligned.crop_width = 1920;
        aligned.crop_height = 1088;
        let mut bs_aligned = Bitstream::new();
        pack_seq_parameter_set(&mut bs_aligned, &aligned);
        // conf_win right/bottom offsets (ue(0) ue(4) ue(0) ue(4)) cost
        // 1+5+1+5 extra bits over the flag-only path.
        assert!(bs.bit_len() > bs_aligned.bit_len());
    }

    #[test]
    fn test_pps_shape() {
        let pic = test_params::pic_idr();
        let mut bs = Bitstream::new();
        pack_pic_parameter_set(&mut bs, &pic);
        let (b0, _) = nal_header_bytes(bs.data());
        assert_eq!(b0, NUT_PPS << 1);
    }

    #[test]
    fn test_idr_slice_header_has_no_poc() {
        let seq = test_params::seq_1080p();
        let pic = test_params::pic_idr();
        let slice = test_params::slice_i();
        let mut bs = Bitstream::new();
        pack_slice_segment_header(&mut bs, &seq, &pic, &slice);
        let (b0, _) = nal_header_bytes(bs.data());
        assert_eq!(b0, NUT_IDR_W_RADL << 1);

        // first_slice(1) + no_output_of_prior_pics(1) + pps id ue(0)=1 +
        // slice_type ue(2)="011" + qp_delta se(0)=1 + alignment: the IDR
        // header is a handful of bits.
        assert!(bs.bit_len() <= 6 * 8 + 16);
    }

    #[test]
    fn test_trail_slice_header_carries_poc_and_rps() {
        let seq = test_params::seq_1080p();
        let mut pic = test_params::pic_idr();
        pic.nal_unit_type = NUT_TRAIL_R;
        pic.idr_pic = false;
        pic.coding_type = 2;
        let mut slice = test_params::slice_i();
        slice.slice_type = SLICE_TYPE_P;
        slice.pic_order_cnt_lsb = 7;
        slice.negative_pics = vec![StRefPic {
            delta_poc_minus1: 0,
            used_by_curr_pic: true,
        }];
        slice.ref_pic_list0[0] = PicRef {
            surface: crate::encode::params::SurfaceId(3),
            poc: 6,
            flags: crate::encode::params::pic_flags::RPS_ST_CURR_BEFORE,
        };
        let mut bs = Bitstream::new();
        pack_slice_segment_header(&mut bs, &seq, &pic, &slice);
        let (b0, _) = nal_header_bytes(bs.data());
        assert_eq!(b0, NUT_TRAIL_R << 1);

        // No no_output_of_prior_pics bit, but 12 bits of POC plus the
        // inline ref pic set: strictly longer than the IDR header.
        let mut idr = Bitstream::new();
        pack_slice_segment_header(
            &mut idr,
            &seq,
            &test_params::pic_idr(),
            &test_params::slice_i(),
        );
        assert!(bs.bit_len() > idr.bit_len());
    }

    #[test]
    fn test_sps_rbsp_field_walk() {
        let seq = test_params::seq_1080p();
        let mut bs = Bitstream::new();
        pack_seq_parameter_set(&mut bs, &seq);

        // Skip start code + NAL header; what follows is raw RBSP.
        let mut reader = BitReader::new(&bs.data()[6..]);
        assert_eq!(reader.read(4), 0, "sps_video_parameter_set_id");
        assert_eq!(reader.read(3), 0, "sps_max_sub_layers_minus1");
        assert!(reader.read_flag(), "sps_temporal_id_nesting_flag");
        assert_eq!(read_profile_tier_level(&mut reader), 120);

        assert_eq!(reader.read_ue(), 0, "sps_seq_parameter_set_id");
        assert_eq!(reader.read_ue(), 1, "chroma_format_idc");
        assert_eq!(reader.read_ue(), 1920, "pic_width_in_luma_samples");
        assert_eq!(reader.read_ue(), 1088, "pic_height_in_luma_samples");

        assert!(reader.read_flag(), "conformance_window_flag");
        assert_eq!(reader.read_ue(), 0, "conf_win_left_offset");
        assert_eq!(reader.read_ue(), 0, "conf_win_right_offset");
        assert_eq!(reader.read_ue(), 0, "conf_win_top_offset");
        // (1088 - 1080) / 2 chroma samples of bottom crop.
        assert_eq!(reader.read_ue(), 4, "conf_win_bottom_offset");

        assert_eq!(reader.read_ue(), 0, "bit_depth_luma_minus8");
        assert_eq!(reader.read_ue(), 0, "bit_depth_chroma_minus8");
        assert_eq!(reader.read_ue(), 8, "log2_max_pic_order_cnt_lsb_minus4");

        assert!(!reader.read_flag(), "sps_sub_layer_ordering_info_present_flag");
        assert_eq!(reader.read_ue(), 1, "sps_max_dec_pic_buffering_minus1");
        assert_eq!(reader.read_ue(), 0, "sps_max_num_reorder_pics");
        assert_eq!(reader.read_ue(), 0, "sps_max_latency_increase_plus1");

        assert_eq!(reader.read_ue(), 0, "log2_min_luma_coding_block_size_minus3");
        assert_eq!(reader.read_ue(), 2, "log2_diff_max_min_luma_coding_block_size");
        assert_eq!(reader.read_ue(), 0, "log2_min_transform_block_size_minus2");
        assert_eq!(reader.read_ue(), 3, "log2_diff_max_min_transform_block_size");
        assert_eq!(reader.read_ue(), 3, "max_transform_hierarchy_depth_inter");
        assert_eq!(reader.read_ue(), 3, "max_transform_hierarchy_depth_intra");

        assert!(!reader.read_flag(), "scaling_list_enabled_flag");
        assert!(reader.read_flag(), "amp_enabled_flag");
        assert!(!reader.read_flag(), "sample_adaptive_offset_enabled_flag");
        assert!(!reader.read_flag(), "pcm_enabled_flag");
        assert_eq!(reader.read_ue(), 0, "num_short_term_ref_pic_sets");
        assert!(!reader.read_flag(), "long_term_ref_pics_present_flag");
        assert!(!reader.read_flag(), "sps_temporal_mvp_enabled_flag");
        assert!(!reader.read_flag(), "strong_intra_smoothing_enabled_flag");

        assert!(reader.read_flag(), "vui_parameters_present_flag");
        assert!(!reader.read_flag(), "aspect_ratio_info_present_flag");
        assert!(!reader.read_flag(), "overscan_info_present_flag");
        assert!(reader.read_flag(), "video_signal_type_present_flag");
        assert_eq!(reader.read(3), 5, "video_format");
        assert!(!reader.read_flag(), "video_full_range_flag");
        assert!(reader.read_flag(), "colour_description_present_flag");
        assert_eq!(reader.read(8), 1, "colour_primaries");
        assert_eq!(reader.read(8), 1, "transfer_characteristics");
        assert_eq!(reader.read(8), 1, "matrix_coeffs");
        assert!(!reader.read_flag(), "chroma_loc_info_present_flag");
        assert!(!reader.read_flag(), "neutral_chroma_indication_flag");
        assert!(!reader.read_flag(), "field_seq_flag");
        assert!(!reader.read_flag(), "frame_field_info_present_flag");
        assert!(!reader.read_flag(), "default_display_window_flag");
        assert!(reader.read_flag(), "vui_timing_info_present_flag");
        assert_eq!(reader.read(32), 1, "vui_num_units_in_tick");
        assert_eq!(reader.read(32), 60, "vui_time_scale");
        assert!(!reader.read_flag(), "vui_poc_proportional_to_timing_flag");
        assert!(!reader.read_flag(), "vui_hrd_parameters_present_flag");
        assert!(reader.read_flag(), "bitstream_restriction_flag");
        assert!(!reader.read_flag(), "tiles_fixed_structure_flag");
        assert!(reader.read_flag(), "motion_vectors_over_pic_boundaries_flag");
        assert!(reader.read_flag(), "restricted_ref_pic_lists_flag");
        assert_eq!(reader.read_ue(), 0, "min_spatial_segmentation_idc");
        assert_eq!(reader.read_ue(), 0, "max_bytes_per_pic_denom");
        assert_eq!(reader.read_ue(), 0, "max_bits_per_min_cu_denom");
        assert_eq!(reader.read_ue(), 15, "log2_max_mv_length_horizontal");
        assert_eq!(reader.read_ue(), 15, "log2_max_mv_length_vertical");

        assert!(!reader.read_flag(), "sps_extension_present_flag");
        assert!(reader.read_flag(), "rbsp_stop_one_bit");
        // Alignment zeros close out the RBSP.
        assert_eq!(6 * 8 + reader.position().div_ceil(8) * 8, bs.bit_len());
    }

    #[test]
    fn test_pps_rbsp_field_walk() {
        let pic = test_params::pic_idr();
        let mut bs = Bitstream::new();
        pack_pic_parameter_set(&mut bs, &pic);

        let mut reader = BitReader::new(&bs.data()[6..]);
        assert_eq!(reader.read_ue(), 0, "pps_pic_parameter_set_id");
        assert_eq!(reader.read_ue(), 0, "pps_seq_parameter_set_id");
        assert!(!reader.read_flag(), "dependent_slice_segments_enabled_flag");
        assert!(!reader.read_flag(), "output_flag_present_flag");
        assert_eq!(reader.read(3), 0, "num_extra_slice_header_bits");
        assert!(!reader.read_flag(), "sign_data_hiding_enabled_flag");
        assert!(!reader.read_flag(), "cabac_init_present_flag");
        assert_eq!(reader.read_ue(), 0, "num_ref_idx_l0_default_active_minus1");
        assert_eq!(reader.read_ue(), 0, "num_ref_idx_l1_default_active_minus1");
        assert_eq!(reader.read_se(), 4, "init_qp_minus26 for qp 30");
        assert!(!reader.read_flag(), "constrained_intra_pred_flag");
        assert!(!reader.read_flag(), "transform_skip_enabled_flag");
        assert!(reader.read_flag(), "cu_qp_delta_enabled_flag");
        assert_eq!(reader.read_ue(), 0, "diff_cu_qp_delta_depth");
        assert_eq!(reader.read_se(), 0, "pps_cb_qp_offset");
        assert_eq!(reader.read_se(), 0, "pps_cr_qp_offset");
        assert!(!reader.read_flag(), "pps_slice_chroma_qp_offsets_present_flag");
        assert!(!reader.read_flag(), "weighted_pred_flag");
        assert!(!reader.read_flag(), "weighted_bipred_flag");
        assert!(!reader.read_flag(), "transquant_bypass_enabled_flag");
        assert!(!reader.read_flag(), "tiles_enabled_flag");
        assert!(!reader.read_flag(), "entropy_coding_sync_enabled_flag");
        assert!(reader.read_flag(), "pps_loop_filter_across_slices_enabled_flag");
        assert!(!reader.read_flag(), "deblocking_filter_control_present_flag");
        assert!(!reader.read_flag(), "scaling_list_data_present_flag");
        assert!(!reader.read_flag(), "lists_modification_present_flag");
        assert_eq!(reader.read_ue(), 0, "log2_parallel_merge_level_minus2");
        assert!(!reader.read_flag(), "slice_segment_header_extension_present_flag");
        assert!(!reader.read_flag(), "pps_extension_present_flag");
        assert!(reader.read_flag(), "rbsp_stop_one_bit");
    }

    #[test]
    fn test_trail_slice_header_field_walk() {
        let seq = test_params::seq_1080p();
        let mut pic = test_params::pic_idr();
        pic.nal_unit_type = NUT_TRAIL_R;
        pic.idr_pic = false;
        pic.coding_type = 2;
        let mut slice = test_params::slice_i();
        slice.slice_type = SLICE_TYPE_P;
        slice.pic_order_cnt_lsb = 7;
        slice.negative_pics = vec![StRefPic {
            delta_poc_minus1: 0,
            used_by_curr_pic: true,
        }];
        let mut bs = Bitstream::new();
        pack_slice_segment_header(&mut bs, &seq, &pic, &slice);

        let mut reader = BitReader::new(&bs.data()[6..]);
        assert!(reader.read_flag(), "first_slice_segment_in_pic_flag");
        // TRAIL_R is not an IRAP: no no_output_of_prior_pics_flag.
        assert_eq!(reader.read_ue(), 0, "slice_pic_parameter_set_id");
        assert_eq!(reader.read_ue(), u32::from(SLICE_TYPE_P), "slice_type");
        assert_eq!(reader.read(PIC_ORDER_CNT_LSB_BITS), 7, "slice_pic_order_cnt_lsb");
        assert!(!reader.read_flag(), "short_term_ref_pic_set_sps_flag");
        assert_eq!(reader.read_ue(), 1, "num_negative_pics");
        assert_eq!(reader.read_ue(), 0, "num_positive_pics");
        assert_eq!(reader.read_ue(), 0, "delta_poc_s0_minus1");
        assert!(reader.read_flag(), "used_by_curr_pic_s0_flag");
        assert!(!reader.read_flag(), "num_ref_idx_active_override_flag");
        assert_eq!(reader.read_ue(), 0, "five_minus_max_num_merge_cand");
        assert_eq!(reader.read_se(), 0, "slice_qp_delta");
        assert!(!reader.read_flag(), "slice_loop_filter_across_slices_enabled_flag");
        assert!(reader.read_flag(), "alignment_bit_equal_to_one");
    }

    #[test]
    fn test_idr_slice_header_field_walk() {
        let seq = test_params::seq_1080p();
        let pic = test_params::pic_idr();
        let slice = test_params::slice_i();
        let mut bs = Bitstream::new();
        pack_slice_segment_header(&mut bs, &seq, &pic, &slice);

        let mut reader = BitReader::new(&bs.data()[6..]);
        assert!(reader.read_flag(), "first_slice_segment_in_pic_flag");
        assert!(!reader.read_flag(), "no_output_of_prior_pics_flag");
        assert_eq!(reader.read_ue(), 0, "slice_pic_parameter_set_id");
        assert_eq!(reader.read_ue(), u32::from(SLICE_TYPE_I), "slice_type");
        // IDR: no POC, no reference picture set, straight to the QP.
        assert_eq!(reader.read_se(), 0, "slice_qp_delta");
        assert!(!reader.read_flag(), "slice_loop_filter_across_slices_enabled_flag");
        assert!(reader.read_flag(), "alignment_bit_equal_to_one");
    }

    #[test]
    fn test_validate_rejects_tiles() {
        let seq = test_params::seq_1080p();
        let mut pic = test_params::pic_idr();
        pic.tiles_enabled = true;
        assert!(matches!(
            validate(&seq, &pic),
            Err(EncoderError::NotSupported(_))
        ));
    }

    #[test]
    fn test_validate_rejects_odd_profile() {
        let mut seq = test_params::seq_1080p();
        seq.general_profile_idc = 4;
        assert!(validate(&seq, &test_params::pic_idr()).is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(validate(&test_params::seq_1080p(), &test_params::pic_idr()).is_ok());
    }
}
