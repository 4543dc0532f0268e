//! Hand-maintained libva binding, loaded with dlopen at runtime.
//!
//! Only the slice-encode path is declared: display setup, config and
//! context creation, surface and buffer management, the picture
//! begin/render/end cycle and PRIME export. Struct layouts follow
//! `va.h` / `va_enc_hevc.h`; C bitfield unions are carried as plain
//! `u32` words composed with [`BitField`], which packs from the LSB the
//! way the SysV ABI allocates bitfields.
//!
//! Loading at runtime (rather than linking) keeps hardware encode in
//! the default build without a build-time libva dependency.

#![allow(non_snake_case)]

use std::ffi::{c_char, c_int, c_void, CStr};

use super::EncoderError;

pub type VADisplay = *mut c_void;
pub type VAStatus = c_int;
pub type VAConfigID = u32;
pub type VAContextID = u32;
pub type VASurfaceID = u32;
pub type VABufferID = u32;

pub const VA_STATUS_SUCCESS: VAStatus = 0;
pub const VA_INVALID_ID: u32 = 0xffff_ffff;
pub const VA_PROGRESSIVE: c_int = 1;
pub const VA_RT_FORMAT_YUV420: u32 = 0x01;
pub const VA_RC_CQP: u32 = 0x10;
pub const VA_ATTRIB_NOT_SUPPORTED: u32 = 0x8000_0000;
pub const VA_TIMEOUT_INFINITE: u64 = u64::MAX;

// VAProfile / VAEntrypoint
pub const VA_PROFILE_HEVC_MAIN: c_int = 17;
pub const VA_ENTRYPOINT_ENC_SLICE: c_int = 6;

// VAConfigAttribType
pub const VA_CONFIG_ATTRIB_RT_FORMAT: c_int = 0;
pub const VA_CONFIG_ATTRIB_RATE_CONTROL: c_int = 5;
pub const VA_CONFIG_ATTRIB_ENC_PACKED_HEADERS: c_int = 10;
pub const VA_CONFIG_ATTRIB_ENC_HEVC_FEATURES: c_int = 50;
pub const VA_CONFIG_ATTRIB_ENC_HEVC_BLOCK_SIZES: c_int = 51;

// VAConfigAttribEncPackedHeaders bits
pub const VA_ENC_PACKED_HEADER_SEQUENCE: u32 = 0x01;
pub const VA_ENC_PACKED_HEADER_PICTURE: u32 = 0x02;
pub const VA_ENC_PACKED_HEADER_SLICE: u32 = 0x04;
pub const VA_ENC_PACKED_HEADER_MISC: u32 = 0x08;

// VABufferType
pub const VA_BUFFER_ENC_CODED: c_int = 21;
pub const VA_BUFFER_ENC_SEQUENCE_PARAMETER: c_int = 22;
pub const VA_BUFFER_ENC_PICTURE_PARAMETER: c_int = 23;
pub const VA_BUFFER_ENC_SLICE_PARAMETER: c_int = 24;
pub const VA_BUFFER_ENC_PACKED_HEADER_PARAMETER: c_int = 25;
pub const VA_BUFFER_ENC_PACKED_HEADER_DATA: c_int = 26;
pub const VA_BUFFER_ENC_MISC_PARAMETER: c_int = 27;

// VAEncPackedHeaderType
pub const VA_ENC_PACKED_HEADER_TYPE_SEQUENCE: c_int = 1;
pub const VA_ENC_PACKED_HEADER_TYPE_SLICE: c_int = 3;

// VAEncMiscParameterType
pub const VA_ENC_MISC_PARAMETER_TYPE_FRAME_RATE: c_int = 0;
pub const VA_ENC_MISC_PARAMETER_TYPE_RATE_CONTROL: c_int = 1;

// VAPictureHEVC flags
pub const VA_PICTURE_HEVC_INVALID: u32 = 0x0000_0001;
pub const VA_PICTURE_HEVC_RPS_ST_CURR_BEFORE: u32 = 0x0000_0010;
pub const VA_PICTURE_HEVC_RPS_ST_CURR_AFTER: u32 = 0x0000_0020;
pub const VA_PICTURE_HEVC_RPS_LT_CURR: u32 = 0x0000_0040;

// vaExportSurfaceHandle
pub const VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2: u32 = 0x4000_0000;
pub const VA_EXPORT_SURFACE_WRITE_ONLY: u32 = 0x0002;
pub const VA_EXPORT_SURFACE_COMPOSED_LAYERS: u32 = 0x0008;

/// LSB-first bitfield packer/unpacker matching C bitfield allocation.
#[derive(Default, Clone, Copy)]
pub struct BitField {
    value: u32,
    shift: u32,
}

impl BitField {
    pub fn pack(value: u32) -> Self {
        Self { value, shift: 0 }
    }

    pub fn push(&mut self, width: u32, value: u32) -> &mut Self {
        debug_assert!(self.shift + width <= 32);
        self.value |= (value & ((1u64 << width) - 1) as u32) << self.shift;
        self.shift += width;
        self
    }

    pub fn push_flag(&mut self, flag: bool) -> &mut Self {
        self.push(1, flag.into())
    }

    pub fn take(&mut self, width: u32) -> u32 {
        let value = (self.value >> self.shift) & ((1u64 << width) - 1) as u32;
        self.shift += width;
        value
    }

    pub fn value(&self) -> u32 {
        self.value
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VAConfigAttrib {
    pub type_: c_int,
    pub value: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VAPictureHEVC {
    pub picture_id: VASurfaceID,
    pub pic_order_cnt: i32,
    pub flags: u32,
    pub va_reserved: [u32; 4],
}

impl VAPictureHEVC {
    pub fn invalid() -> Self {
        Self {
            picture_id: VA_INVALID_ID,
            pic_order_cnt: 0,
            flags: VA_PICTURE_HEVC_INVALID,
            va_reserved: [0; 4],
        }
    }
}

#[repr(C)]
pub struct VAEncSequenceParameterBufferHEVC {
    pub general_profile_idc: u8,
    pub general_level_idc: u8,
    pub general_tier_flag: u8,
    pub intra_period: u32,
    pub intra_idr_period: u32,
    pub ip_period: u32,
    pub bits_per_second: u32,
    pub pic_width_in_luma_samples: u16,
    pub pic_height_in_luma_samples: u16,
    /// chroma_format_idc:2, separate_colour_plane:1,
    /// bit_depth_luma_minus8:3, bit_depth_chroma_minus8:3,
    /// scaling_list_enabled:1, strong_intra_smoothing_enabled:1,
    /// amp_enabled:1, sample_adaptive_offset_enabled:1, pcm_enabled:1,
    /// pcm_loop_filter_disabled:1, sps_temporal_mvp_enabled:1,
    /// low_delay_seq:1, hierachical_flag:1.
    pub seq_fields: u32,
    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_luma_coding_block_size: u8,
    pub log2_min_transform_block_size_minus2: u8,
    pub log2_diff_max_min_transform_block_size: u8,
    pub max_transform_hierarchy_depth_inter: u8,
    pub max_transform_hierarchy_depth_intra: u8,
    pub pcm_sample_bit_depth_luma_minus1: u32,
    pub pcm_sample_bit_depth_chroma_minus1: u32,
    pub log2_min_pcm_luma_coding_block_size_minus3: u32,
    pub log2_max_pcm_luma_coding_block_size_minus3: u32,
    pub vui_parameters_present_flag: u8,
    /// aspect_ratio_info_present:1, neutral_chroma_indication:1,
    /// field_seq:1, vui_timing_info_present:1,
    /// bitstream_restriction:1, tiles_fixed_structure:1,
    /// motion_vectors_over_pic_boundaries:1, restricted_ref_pic_lists:1.
    pub vui_fields: u32,
    pub aspect_ratio_idc: u8,
    pub sar_width: u32,
    pub sar_height: u32,
    pub vui_num_units_in_tick: u32,
    pub vui_time_scale: u32,
    pub min_spatial_segmentation_idc: u16,
    pub max_bytes_per_pic_denom: u8,
    pub max_bits_per_min_cu_denom: u8,
    pub log2_max_mv_length_horizontal: u8,
    pub log2_max_mv_length_vertical: u8,
    pub scc_fields: u32,
    pub va_reserved: [u32; 8],
}

#[repr(C)]
pub struct VAEncPictureParameterBufferHEVC {
    pub decoded_curr_pic: VAPictureHEVC,
    pub reference_frames: [VAPictureHEVC; 15],
    pub coded_buf: VABufferID,
    pub collocated_ref_pic_index: u8,
    pub last_picture: u8,
    pub pic_init_qp: u8,
    pub diff_cu_qp_delta_depth: u8,
    pub pps_cb_qp_offset: i8,
    pub pps_cr_qp_offset: i8,
    pub num_tile_columns_minus1: u8,
    pub num_tile_rows_minus1: u8,
    pub column_width_minus1: [u8; 19],
    pub row_height_minus1: [u8; 21],
    pub ctu_max_bitsize_allowed: u32,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub slice_pic_parameter_set_id: u8,
    pub nal_unit_type: u8,
    /// idr_pic:1, coding_type:3, reference_pic:1,
    /// dependent_slice_segments_enabled:1, sign_data_hiding_enabled:1,
    /// constrained_intra_pred:1, transform_skip_enabled:1,
    /// cu_qp_delta_enabled:1, weighted_pred:1, weighted_bipred:1,
    /// transquant_bypass_enabled:1, tiles_enabled:1,
    /// entropy_coding_sync_enabled:1, loop_filter_across_tiles:1,
    /// pps_loop_filter_across_slices:1, scaling_list_data_present:1,
    /// screen_content:1, enable_gpu_weighted_prediction:1,
    /// no_output_of_prior_pics:1.
    pub pic_fields: u32,
    pub hierarchical_level_plus1: u8,
    pub va_byte_reserved: u8,
    pub screen_content_pic_fields: u16,
    pub va_reserved: [u32; 8],
}

#[repr(C)]
pub struct VAEncSliceParameterBufferHEVC {
    pub slice_segment_address: u32,
    pub num_ctu_in_slice: u32,
    pub slice_type: u8,
    pub slice_pic_parameter_set_id: u8,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list0: [VAPictureHEVC; 15],
    pub ref_pic_list1: [VAPictureHEVC; 15],
    pub luma_log2_weight_denom: u8,
    pub delta_chroma_log2_weight_denom: i8,
    pub delta_luma_weight_l0: [i8; 15],
    pub luma_offset_l0: [i8; 15],
    pub delta_chroma_weight_l0: [[i8; 2]; 15],
    pub chroma_offset_l0: [[i8; 2]; 15],
    pub delta_luma_weight_l1: [i8; 15],
    pub luma_offset_l1: [i8; 15],
    pub delta_chroma_weight_l1: [[i8; 2]; 15],
    pub chroma_offset_l1: [[i8; 2]; 15],
    pub max_num_merge_cand: u8,
    pub slice_qp_delta: i8,
    pub slice_cb_qp_offset: i8,
    pub slice_cr_qp_offset: i8,
    pub slice_beta_offset_div2: i8,
    pub slice_tc_offset_div2: i8,
    /// last_slice_of_pic:1, dependent_slice_segment:1,
    /// colour_plane_id:2, slice_temporal_mvp_enabled:1,
    /// slice_sao_luma:1, slice_sao_chroma:1,
    /// num_ref_idx_active_override:1, mvd_l1_zero:1, cabac_init:1,
    /// slice_deblocking_filter_disabled:2,
    /// slice_loop_filter_across_slices_enabled:1,
    /// collocated_from_l0:1.
    pub slice_fields: u32,
    pub pred_weight_table_bit_offset: u32,
    pub pred_weight_table_bit_length: u32,
    pub va_reserved: [u32; 8],
}

#[repr(C)]
pub struct VAEncMiscParameterBuffer {
    pub type_: c_int,
    // Payload follows inline; buffers are created with the payload
    // appended after this header.
}

#[repr(C)]
pub struct VAEncMiscParameterRateControl {
    pub bits_per_second: u32,
    pub target_percentage: u32,
    pub window_size: u32,
    pub initial_qp: u32,
    pub min_qp: u32,
    pub basic_unit_size: u32,
    pub rc_flags: u32,
    pub ICQ_quality_factor: u32,
    pub max_qp: u32,
    pub quality_factor: u32,
    pub target_frame_size: u32,
    pub va_reserved: [u32; 5],
}

#[repr(C)]
pub struct VAEncMiscParameterFrameRate {
    /// fps numerator in the low 16 bits, denominator in the high ones.
    pub framerate: u32,
    pub framerate_flags: u32,
    pub va_reserved: [u32; 2],
}

#[repr(C)]
pub struct VAEncPackedHeaderParameterBuffer {
    pub type_: c_int,
    pub bit_length: u32,
    pub has_emulation_bytes: u8,
    pub va_reserved: [u32; 4],
}

#[repr(C)]
pub struct VACodedBufferSegment {
    pub size: u32,
    pub bit_offset: u32,
    pub status: u32,
    pub reserved: u32,
    pub buf: *mut c_void,
    pub next: *mut VACodedBufferSegment,
    pub va_reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VADRMPRIMESurfaceObject {
    pub fd: c_int,
    pub size: u32,
    pub drm_format_modifier: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VADRMPRIMESurfaceLayer {
    pub drm_format: u32,
    pub num_planes: u32,
    pub object_index: [u32; 4],
    pub offset: [u32; 4],
    pub pitch: [u32; 4],
}

#[repr(C)]
pub struct VADRMPRIMESurfaceDescriptor {
    pub fourcc: u32,
    pub width: u32,
    pub height: u32,
    pub num_objects: u32,
    pub objects: [VADRMPRIMESurfaceObject; 4],
    pub num_layers: u32,
    pub layers: [VADRMPRIMESurfaceLayer; 4],
}

pub type VAMessageCallback = unsafe extern "C" fn(*mut c_void, *const c_char);

type PfnGetDisplayDRM = unsafe extern "C" fn(c_int) -> VADisplay;
type PfnInitialize = unsafe extern "C" fn(VADisplay, *mut c_int, *mut c_int) -> VAStatus;
type PfnTerminate = unsafe extern "C" fn(VADisplay) -> VAStatus;
type PfnErrorStr = unsafe extern "C" fn(VAStatus) -> *const c_char;
type PfnSetMessageCallback =
    unsafe extern "C" fn(VADisplay, VAMessageCallback, *mut c_void) -> VAMessageCallback;
type PfnGetConfigAttributes =
    unsafe extern "C" fn(VADisplay, c_int, c_int, *mut VAConfigAttrib, c_int) -> VAStatus;
type PfnCreateConfig = unsafe extern "C" fn(
    VADisplay,
    c_int,
    c_int,
    *const VAConfigAttrib,
    c_int,
    *mut VAConfigID,
) -> VAStatus;
type PfnDestroyConfig = unsafe extern "C" fn(VADisplay, VAConfigID) -> VAStatus;
type PfnCreateContext = unsafe extern "C" fn(
    VADisplay,
    VAConfigID,
    c_int,
    c_int,
    c_int,
    *mut VASurfaceID,
    c_int,
    *mut VAContextID,
) -> VAStatus;
type PfnDestroyContext = unsafe extern "C" fn(VADisplay, VAContextID) -> VAStatus;
type PfnCreateSurfaces = unsafe extern "C" fn(
    VADisplay,
    u32,
    u32,
    u32,
    *mut VASurfaceID,
    u32,
    *mut c_void,
    u32,
) -> VAStatus;
type PfnDestroySurfaces = unsafe extern "C" fn(VADisplay, *mut VASurfaceID, c_int) -> VAStatus;
type PfnCreateBuffer = unsafe extern "C" fn(
    VADisplay,
    VAContextID,
    c_int,
    u32,
    u32,
    *mut c_void,
    *mut VABufferID,
) -> VAStatus;
type PfnDestroyBuffer = unsafe extern "C" fn(VADisplay, VABufferID) -> VAStatus;
type PfnBeginPicture = unsafe extern "C" fn(VADisplay, VAContextID, VASurfaceID) -> VAStatus;
type PfnRenderPicture =
    unsafe extern "C" fn(VADisplay, VAContextID, *mut VABufferID, c_int) -> VAStatus;
type PfnEndPicture = unsafe extern "C" fn(VADisplay, VAContextID) -> VAStatus;
type PfnSyncBuffer = unsafe extern "C" fn(VADisplay, VABufferID, u64) -> VAStatus;
type PfnSyncSurface = unsafe extern "C" fn(VADisplay, VASurfaceID) -> VAStatus;
type PfnMapBuffer = unsafe extern "C" fn(VADisplay, VABufferID, *mut *mut c_void) -> VAStatus;
type PfnUnmapBuffer = unsafe extern "C" fn(VADisplay, VABufferID) -> VAStatus;
type PfnExportSurfaceHandle =
    unsafe extern "C" fn(VADisplay, VASurfaceID, u32, u32, *mut c_void) -> VAStatus;

/// Route driver log messages into tracing.
pub unsafe extern "C" fn on_va_message(_context: *mut c_void, message: *const c_char) {
    if message.is_null() {
        return;
    }
    let text = CStr::from_ptr(message).to_string_lossy();
    tracing::debug!("libva: {}", text.trim_end_matches('\n'));
}

/// Loaded libva + libva-drm entry points.
pub struct Va {
    _libva: libloading::Library,
    _libva_drm: libloading::Library,
    pub get_display_drm: PfnGetDisplayDRM,
    pub initialize: PfnInitialize,
    pub terminate: PfnTerminate,
    pub error_str: PfnErrorStr,
    pub set_error_callback: PfnSetMessageCallback,
    pub set_info_callback: PfnSetMessageCallback,
    pub get_config_attributes: PfnGetConfigAttributes,
    pub create_config: PfnCreateConfig,
    pub destroy_config: PfnDestroyConfig,
    pub create_context: PfnCreateContext,
    pub destroy_context: PfnDestroyContext,
    pub create_surfaces: PfnCreateSurfaces,
    pub destroy_surfaces: PfnDestroySurfaces,
    pub create_buffer: PfnCreateBuffer,
    pub destroy_buffer: PfnDestroyBuffer,
    pub begin_picture: PfnBeginPicture,
    pub render_picture: PfnRenderPicture,
    pub end_picture: PfnEndPicture,
    /// Absent before libva 1.9; [`Va::sync_surface`] is the fallback.
    pub sync_buffer: Option<PfnSyncBuffer>,
    pub sync_surface: PfnSyncSurface,
    pub map_buffer: PfnMapBuffer,
    pub unmap_buffer: PfnUnmapBuffer,
    pub export_surface_handle: PfnExportSurfaceHandle,
}

impl Va {
    pub fn load() -> Result<Self, EncoderError> {
        let open = |name: &str| {
            // Safety: libva registers no problematic constructors.
            unsafe { libloading::Library::new(name) }
                .map_err(|err| EncoderError::Driver(format!("{name}: {err}")))
        };
        let libva = open("libva.so.2")?;
        let libva_drm = open("libva-drm.so.2")?;

        macro_rules! symbol {
            ($lib:expr, $name:literal) => {
                unsafe {
                    *$lib.get($name).map_err(|err| {
                        EncoderError::Driver(format!(
                            "{}: {err}",
                            String::from_utf8_lossy($name)
                        ))
                    })?
                }
            };
        }

        Ok(Self {
            get_display_drm: symbol!(libva_drm, b"vaGetDisplayDRM\0"),
            initialize: symbol!(libva, b"vaInitialize\0"),
            terminate: symbol!(libva, b"vaTerminate\0"),
            error_str: symbol!(libva, b"vaErrorStr\0"),
            set_error_callback: symbol!(libva, b"vaSetErrorCallback\0"),
            set_info_callback: symbol!(libva, b"vaSetInfoCallback\0"),
            get_config_attributes: symbol!(libva, b"vaGetConfigAttributes\0"),
            create_config: symbol!(libva, b"vaCreateConfig\0"),
            destroy_config: symbol!(libva, b"vaDestroyConfig\0"),
            create_context: symbol!(libva, b"vaCreateContext\0"),
            destroy_context: symbol!(libva, b"vaDestroyContext\0"),
            create_surfaces: symbol!(libva, b"vaCreateSurfaces\0"),
            destroy_surfaces: symbol!(libva, b"vaDestroySurfaces\0"),
            create_buffer: symbol!(libva, b"vaCreateBuffer\0"),
            destroy_buffer: symbol!(libva, b"vaDestroyBuffer\0"),
            begin_picture: symbol!(libva, b"vaBeginPicture\0"),
            render_picture: symbol!(libva, b"vaRenderPicture\0"),
            end_picture: symbol!(libva, b"vaEndPicture\0"),
            sync_buffer: unsafe { libva.get(b"vaSyncBuffer\0").ok().map(|symbol| *symbol) },
            sync_surface: symbol!(libva, b"vaSyncSurface\0"),
            map_buffer: symbol!(libva, b"vaMapBuffer\0"),
            unmap_buffer: symbol!(libva, b"vaUnmapBuffer\0"),
            export_surface_handle: symbol!(libva, b"vaExportSurfaceHandle\0"),
            _libva: libva,
            _libva_drm: libva_drm,
        })
    }

    pub fn error_string(&self, status: VAStatus) -> String {
        let raw = unsafe { (self.error_str)(status) };
        if raw.is_null() {
            return format!("VA status {status}");
        }
        unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned()
    }

    pub fn check(&self, status: VAStatus, op: &'static str) -> Result<(), EncoderError> {
        if status == VA_STATUS_SUCCESS {
            Ok(())
        } else {
            Err(EncoderError::Driver(format!(
                "{op} failed ({})",
                self.error_string(status)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitfield_packs_lsb_first() {
        let mut bits = BitField::default();
        bits.push(2, 0b01).push_flag(true).push(3, 0b101);
        // 2 bits of chroma, then a flag at bit 2, then 3 bits at bit 3.
        assert_eq!(bits.value(), 0b101_1_01);
    }

    #[test]
    fn test_bitfield_roundtrip() {
        let mut writer = BitField::default();
        writer.push(2, 1).push(1, 0).push(3, 0).push(3, 0).push(1, 1);
        let mut reader = BitField::pack(writer.value());
        assert_eq!(reader.take(2), 1);
        assert_eq!(reader.take(1), 0);
        assert_eq!(reader.take(3), 0);
        assert_eq!(reader.take(3), 0);
        assert_eq!(reader.take(1), 1);
    }

    #[test]
    fn test_picture_struct_sizes() {
        // VAPictureHEVC is 4+4+4+16 bytes; the arrays in the parameter
        // buffers scale from it. A drift here corrupts the driver ABI.
        assert_eq!(std::mem::size_of::<VAPictureHEVC>(), 28);
        assert_eq!(std::mem::size_of::<VADRMPRIMESurfaceObject>(), 16);
    }
}
