//! VA-API implementation of the [`CodecDriver`] seam.
//!
//! Owns the render node, the encode config/context, the persistent
//! input surface (exported to the GPU converter as dmabuf planes), the
//! reconstruction surface ring and the coded output buffer. Parameter
//! uploads accumulate as VA buffers; `execute` runs the picture and
//! maps the coded segment back out.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::mem::{size_of, MaybeUninit};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use super::bitstream::Bitstream;
use super::params::{
    DriverCaps, FrameRateParams, HevcBlockSizeCaps, HevcFeatureCaps, PackedHeaderCaps, PicParams,
    PicRef, RateControlParams, SeqParams, SliceParams, SurfaceId,
};
use super::sys::{self, BitField, Va, VABufferID, VASurfaceID};
use super::{CodecDriver, EncoderError, PackedHeaderKind, MIN_CB_SIZE, RECON_RING};
use crate::gpu::{FrameDescriptor, PlaneDescriptor};

const RENDER_NODE: &str = "/dev/dri/renderD128";

pub struct VaDriver {
    va: Va,
    _render_node: File,
    display: sys::VADisplay,
    config: sys::VAConfigID,
    context: sys::VAContextID,
    input_surface: VASurfaceID,
    recon_surfaces: [VASurfaceID; RECON_RING],
    recon_ids: [SurfaceId; RECON_RING],
    coded_buffer: VABufferID,
    caps: DriverCaps,
    pending: Vec<VABufferID>,
}

impl VaDriver {
    /// Open the render node and build the whole encode session for the
    /// given crop size. The coded size is aligned up to the minimum
    /// coding block size.
    pub fn new(width: u32, height: u32) -> Result<Self, EncoderError> {
        let va = Va::load()?;
        let render_node = OpenOptions::new()
            .read(true)
            .write(true)
            .open(RENDER_NODE)
            .map_err(EncoderError::Io)?;

        let display = unsafe { (va.get_display_drm)(render_node.as_raw_fd()) };
        if display.is_null() {
            return Err(EncoderError::Driver("vaGetDisplayDRM returned null".into()));
        }

        unsafe {
            (va.set_error_callback)(display, sys::on_va_message, std::ptr::null_mut());
            if cfg!(debug_assertions) {
                (va.set_info_callback)(display, sys::on_va_message, std::ptr::null_mut());
            }
        }

        let (mut major, mut minor) = (0, 0);
        va.check(
            unsafe { (va.initialize)(display, &mut major, &mut minor) },
            "vaInitialize",
        )?;
        tracing::info!("initialized VA {major}.{minor}");

        // One-shot capability probe; everything downstream keys off it.
        let mut probe = [
            sys::VAConfigAttrib {
                type_: sys::VA_CONFIG_ATTRIB_ENC_PACKED_HEADERS,
                value: 0,
            },
            sys::VAConfigAttrib {
                type_: sys::VA_CONFIG_ATTRIB_ENC_HEVC_FEATURES,
                value: 0,
            },
            sys::VAConfigAttrib {
                type_: sys::VA_CONFIG_ATTRIB_ENC_HEVC_BLOCK_SIZES,
                value: 0,
            },
        ];
        va.check(
            unsafe {
                (va.get_config_attributes)(
                    display,
                    sys::VA_PROFILE_HEVC_MAIN,
                    sys::VA_ENTRYPOINT_ENC_SLICE,
                    probe.as_mut_ptr(),
                    probe.len() as i32,
                )
            },
            "vaGetConfigAttributes",
        )
        .inspect_err(|_| unsafe {
            (va.terminate)(display);
        })?;

        let caps = DriverCaps {
            packed_headers: decode_packed_headers(probe[0].value),
            features: decode_features(probe[1].value),
            block_sizes: decode_block_sizes(probe[2].value),
        };
        tracing::debug!("driver caps: {caps:?}");

        let coded_width = width.div_ceil(MIN_CB_SIZE) * MIN_CB_SIZE;
        let coded_height = height.div_ceil(MIN_CB_SIZE) * MIN_CB_SIZE;

        let mut config_attribs = vec![
            sys::VAConfigAttrib {
                type_: sys::VA_CONFIG_ATTRIB_RT_FORMAT,
                value: sys::VA_RT_FORMAT_YUV420,
            },
            sys::VAConfigAttrib {
                type_: sys::VA_CONFIG_ATTRIB_RATE_CONTROL,
                value: sys::VA_RC_CQP,
            },
        ];
        let mut packed_bits = 0;
        if caps.packed_headers.sequence {
            packed_bits |= sys::VA_ENC_PACKED_HEADER_SEQUENCE;
        }
        if caps.packed_headers.slice {
            packed_bits |= sys::VA_ENC_PACKED_HEADER_SLICE;
        }
        if packed_bits != 0 {
            config_attribs.push(sys::VAConfigAttrib {
                type_: sys::VA_CONFIG_ATTRIB_ENC_PACKED_HEADERS,
                value: packed_bits,
            });
        }

        // Construction from here on rolls back with Builder's Drop-less
        // explicit unwinding below.
        let mut config = sys::VA_INVALID_ID;
        let status = unsafe {
            (va.create_config)(
                display,
                sys::VA_PROFILE_HEVC_MAIN,
                sys::VA_ENTRYPOINT_ENC_SLICE,
                config_attribs.as_ptr(),
                config_attribs.len() as i32,
                &mut config,
            )
        };
        if let Err(err) = va.check(status, "vaCreateConfig") {
            unsafe { (va.terminate)(display) };
            return Err(err);
        }

        type SessionParts = (
            sys::VAContextID,
            VASurfaceID,
            [VASurfaceID; RECON_RING],
            VABufferID,
        );
        let build = (|| -> Result<SessionParts, EncoderError> {
            let mut context = sys::VA_INVALID_ID;
            va.check(
                unsafe {
                    (va.create_context)(
                        display,
                        config,
                        coded_width as i32,
                        coded_height as i32,
                        sys::VA_PROGRESSIVE,
                        std::ptr::null_mut(),
                        0,
                        &mut context,
                    )
                },
                "vaCreateContext",
            )?;

            let mut input_surface = sys::VA_INVALID_ID;
            va.check(
                unsafe {
                    (va.create_surfaces)(
                        display,
                        sys::VA_RT_FORMAT_YUV420,
                        width,
                        height,
                        &mut input_surface,
                        1,
                        std::ptr::null_mut(),
                        0,
                    )
                },
                "vaCreateSurfaces(input)",
            )
            .inspect_err(|_| unsafe {
                (va.destroy_context)(display, context);
            })?;

            let mut recon = [sys::VA_INVALID_ID; RECON_RING];
            va.check(
                unsafe {
                    (va.create_surfaces)(
                        display,
                        sys::VA_RT_FORMAT_YUV420,
                        coded_width,
                        coded_height,
                        recon.as_mut_ptr(),
                        RECON_RING as u32,
                        std::ptr::null_mut(),
                        0,
                    )
                },
                "vaCreateSurfaces(recon)",
            )
            .inspect_err(|_| unsafe {
                (va.destroy_surfaces)(display, &mut input_surface, 1);
                (va.destroy_context)(display, context);
            })?;

            let mut coded_buffer = sys::VA_INVALID_ID;
            let coded_size = width * height * 3 / 2;
            va.check(
                unsafe {
                    (va.create_buffer)(
                        display,
                        context,
                        sys::VA_BUFFER_ENC_CODED,
                        coded_size,
                        1,
                        std::ptr::null_mut(),
                        &mut coded_buffer,
                    )
                },
                "vaCreateBuffer(coded)",
            )
            .inspect_err(|_| unsafe {
                (va.destroy_surfaces)(display, recon.as_mut_ptr(), RECON_RING as i32);
                (va.destroy_surfaces)(display, &mut input_surface, 1);
                (va.destroy_context)(display, context);
            })?;

            Ok((context, input_surface, recon, coded_buffer))
        })();

        let (context, input_surface, recon_surfaces, coded_buffer) = match build {
            Ok(parts) => parts,
            Err(err) => {
                unsafe {
                    (va.destroy_config)(display, config);
                    (va.terminate)(display);
                }
                return Err(err);
            }
        };

        Ok(Self {
            va,
            _render_node: render_node,
            display,
            config,
            context,
            input_surface,
            recon_surfaces,
            recon_ids: recon_surfaces.map(SurfaceId),
            coded_buffer,
            caps,
            pending: Vec::with_capacity(12),
        })
    }

    /// Export the persistent input surface as dmabuf planes; the GPU
    /// context imports them as the conversion render target.
    pub fn export_input_frame(&self) -> Result<FrameDescriptor, EncoderError> {
        let mut prime = unsafe { MaybeUninit::<sys::VADRMPRIMESurfaceDescriptor>::zeroed().assume_init() };
        self.va.check(
            unsafe {
                (self.va.export_surface_handle)(
                    self.display,
                    self.input_surface,
                    sys::VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2,
                    sys::VA_EXPORT_SURFACE_WRITE_ONLY | sys::VA_EXPORT_SURFACE_COMPOSED_LAYERS,
                    &mut prime as *mut _ as *mut c_void,
                )
            },
            "vaExportSurfaceHandle",
        )?;

        // The descriptor hands over one fd per object; wrap them so they
        // close however plane assembly goes.
        let objects: Vec<OwnedFd> = prime.objects[..(prime.num_objects as usize).min(4)]
            .iter()
            .map(|object| unsafe { OwnedFd::from_raw_fd(object.fd) })
            .collect();

        let layer = &prime.layers[0];
        let mut planes = Vec::new();
        for index in 0..(layer.num_planes as usize).min(4) {
            let object_index = layer.object_index[index] as usize;
            let object = objects.get(object_index).ok_or_else(|| {
                EncoderError::Driver("prime descriptor references a missing object".into())
            })?;
            planes.push(PlaneDescriptor {
                // Planes may share one object; every plane gets its own fd.
                fd: object.try_clone().map_err(EncoderError::Io)?,
                offset: layer.offset[index],
                pitch: layer.pitch[index],
                modifier: prime.objects[object_index].drm_format_modifier,
            });
        }

        Ok(FrameDescriptor {
            width: prime.width,
            height: prime.height,
            fourcc: prime.fourcc,
            planes,
        })
    }

    fn upload(
        &mut self,
        buffer_type: i32,
        data: *const c_void,
        size: u32,
        what: &'static str,
    ) -> Result<(), EncoderError> {
        let mut buffer = sys::VA_INVALID_ID;
        self.va.check(
            unsafe {
                (self.va.create_buffer)(
                    self.display,
                    self.context,
                    buffer_type,
                    size,
                    1,
                    data as *mut c_void,
                    &mut buffer,
                )
            },
            what,
        )?;
        self.pending.push(buffer);
        Ok(())
    }

    fn upload_struct<T>(
        &mut self,
        buffer_type: i32,
        value: &T,
        what: &'static str,
    ) -> Result<(), EncoderError> {
        self.upload(
            buffer_type,
            value as *const T as *const c_void,
            size_of::<T>() as u32,
            what,
        )
    }

    fn upload_misc<T>(&mut self, misc_type: i32, value: &T) -> Result<(), EncoderError> {
        // VAEncMiscParameterBuffer is a 4-byte type header with the
        // payload inline behind it.
        let mut bytes = Vec::with_capacity(4 + size_of::<T>());
        bytes.extend_from_slice(&misc_type.to_ne_bytes());
        bytes.extend_from_slice(unsafe {
            std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>())
        });
        self.upload(
            sys::VA_BUFFER_ENC_MISC_PARAMETER,
            bytes.as_ptr() as *const c_void,
            bytes.len() as u32,
            "vaCreateBuffer(misc)",
        )
    }

    fn execute_inner(&mut self) -> Result<Vec<u8>, EncoderError> {
        let va = &self.va;
        va.check(
            unsafe { (va.begin_picture)(self.display, self.context, self.input_surface) },
            "vaBeginPicture",
        )?;
        va.check(
            unsafe {
                (va.render_picture)(
                    self.display,
                    self.context,
                    self.pending.as_mut_ptr(),
                    self.pending.len() as i32,
                )
            },
            "vaRenderPicture",
        )?;
        va.check(
            unsafe { (va.end_picture)(self.display, self.context) },
            "vaEndPicture",
        )?;

        match va.sync_buffer {
            Some(sync_buffer) => va.check(
                unsafe { sync_buffer(self.display, self.coded_buffer, sys::VA_TIMEOUT_INFINITE) },
                "vaSyncBuffer",
            )?,
            None => va.check(
                unsafe { (va.sync_surface)(self.display, self.input_surface) },
                "vaSyncSurface",
            )?,
        }

        let mut mapped: *mut c_void = std::ptr::null_mut();
        va.check(
            unsafe { (va.map_buffer)(self.display, self.coded_buffer, &mut mapped) },
            "vaMapBuffer",
        )?;
        let segment = mapped as *const sys::VACodedBufferSegment;
        let result = unsafe {
            if (*segment).next.is_null() {
                Ok(std::slice::from_raw_parts((*segment).buf as *const u8, (*segment).size as usize)
                    .to_vec())
            } else {
                Err(EncoderError::MultiSegment)
            }
        };
        unsafe { (va.unmap_buffer)(self.display, self.coded_buffer) };
        result
    }
}

impl CodecDriver for VaDriver {
    fn caps(&self) -> DriverCaps {
        self.caps
    }

    fn input_surface(&self) -> SurfaceId {
        SurfaceId(self.input_surface)
    }

    fn recon_surfaces(&self) -> &[SurfaceId] {
        &self.recon_ids
    }

    fn upload_sequence(&mut self, seq: &SeqParams) -> Result<(), EncoderError> {
        let va_seq = seq_to_va(seq);
        self.upload_struct(
            sys::VA_BUFFER_ENC_SEQUENCE_PARAMETER,
            &va_seq,
            "vaCreateBuffer(sequence)",
        )
    }

    fn upload_rate_control(&mut self, rc: &RateControlParams) -> Result<(), EncoderError> {
        let va_rc = sys::VAEncMiscParameterRateControl {
            bits_per_second: rc.bits_per_second,
            target_percentage: rc.target_percentage,
            window_size: rc.window_size,
            initial_qp: rc.initial_qp,
            min_qp: rc.min_qp,
            basic_unit_size: 0,
            rc_flags: 0,
            ICQ_quality_factor: 0,
            max_qp: rc.max_qp,
            quality_factor: 0,
            target_frame_size: 0,
            va_reserved: [0; 5],
        };
        self.upload_misc(sys::VA_ENC_MISC_PARAMETER_TYPE_RATE_CONTROL, &va_rc)
    }

    fn upload_frame_rate(&mut self, fr: &FrameRateParams) -> Result<(), EncoderError> {
        let va_fr = sys::VAEncMiscParameterFrameRate {
            framerate: fr.num | (fr.den << 16),
            framerate_flags: 0,
            va_reserved: [0; 2],
        };
        self.upload_misc(sys::VA_ENC_MISC_PARAMETER_TYPE_FRAME_RATE, &va_fr)
    }

    fn upload_picture(&mut self, pic: &PicParams) -> Result<(), EncoderError> {
        let va_pic = pic_to_va(pic, self.coded_buffer);
        self.upload_struct(
            sys::VA_BUFFER_ENC_PICTURE_PARAMETER,
            &va_pic,
            "vaCreateBuffer(picture)",
        )
    }

    fn upload_slice(&mut self, slice: &SliceParams) -> Result<(), EncoderError> {
        let va_slice = slice_to_va(slice);
        self.upload_struct(
            sys::VA_BUFFER_ENC_SLICE_PARAMETER,
            &va_slice,
            "vaCreateBuffer(slice)",
        )
    }

    fn upload_packed_header(
        &mut self,
        kind: PackedHeaderKind,
        header: &Bitstream,
    ) -> Result<(), EncoderError> {
        let param = sys::VAEncPackedHeaderParameterBuffer {
            type_: match kind {
                PackedHeaderKind::Sequence => sys::VA_ENC_PACKED_HEADER_TYPE_SEQUENCE,
                PackedHeaderKind::Slice => sys::VA_ENC_PACKED_HEADER_TYPE_SLICE,
            },
            bit_length: header.bit_len() as u32,
            // The driver inserts emulation prevention bytes; we hand it
            // raw RBSP.
            has_emulation_bytes: 1,
            va_reserved: [0; 4],
        };
        self.upload_struct(
            sys::VA_BUFFER_ENC_PACKED_HEADER_PARAMETER,
            &param,
            "vaCreateBuffer(packed header param)",
        )?;
        self.upload(
            sys::VA_BUFFER_ENC_PACKED_HEADER_DATA,
            header.data().as_ptr() as *const c_void,
            header.data().len() as u32,
            "vaCreateBuffer(packed header data)",
        )
    }

    fn execute(&mut self) -> Result<Vec<u8>, EncoderError> {
        let result = self.execute_inner();
        // Per-frame buffers go in reverse creation order, success or not.
        while let Some(buffer) = self.pending.pop() {
            unsafe { (self.va.destroy_buffer)(self.display, buffer) };
        }
        result
    }
}

impl Drop for VaDriver {
    fn drop(&mut self) {
        unsafe {
            while let Some(buffer) = self.pending.pop() {
                (self.va.destroy_buffer)(self.display, buffer);
            }
            (self.va.destroy_buffer)(self.display, self.coded_buffer);
            (self.va.destroy_surfaces)(
                self.display,
                self.recon_surfaces.as_mut_ptr(),
                RECON_RING as i32,
            );
            (self.va.destroy_surfaces)(self.display, &mut self.input_surface, 1);
            (self.va.destroy_context)(self.display, self.context);
            (self.va.destroy_config)(self.display, self.config);
            (self.va.terminate)(self.display);
        }
    }
}

fn decode_packed_headers(value: u32) -> PackedHeaderCaps {
    if value == sys::VA_ATTRIB_NOT_SUPPORTED {
        return PackedHeaderCaps::default();
    }
    PackedHeaderCaps {
        sequence: value & sys::VA_ENC_PACKED_HEADER_SEQUENCE != 0,
        slice: value & sys::VA_ENC_PACKED_HEADER_SLICE != 0,
        misc: value & sys::VA_ENC_PACKED_HEADER_MISC != 0,
    }
}

fn decode_features(value: u32) -> Option<HevcFeatureCaps> {
    if value == sys::VA_ATTRIB_NOT_SUPPORTED {
        return None;
    }
    let mut bits = BitField::pack(value);
    let _separate_colour_planes = bits.take(2);
    let _scaling_lists = bits.take(2);
    let amp = bits.take(2);
    let sao = bits.take(2);
    let pcm = bits.take(2);
    let temporal_mvp = bits.take(2);
    let strong_intra_smoothing = bits.take(2);
    let dependent_slices = bits.take(2);
    let sign_data_hiding = bits.take(2);
    let constrained_intra_pred = bits.take(2);
    let transform_skip = bits.take(2);
    let cu_qp_delta = bits.take(2);
    let weighted_prediction = bits.take(2);
    let transquant_bypass = bits.take(2);
    Some(HevcFeatureCaps {
        amp: amp != 0,
        sample_adaptive_offset: sao != 0,
        pcm: pcm != 0,
        temporal_mvp: temporal_mvp != 0,
        strong_intra_smoothing: strong_intra_smoothing != 0,
        dependent_slices: dependent_slices != 0,
        sign_data_hiding: sign_data_hiding != 0,
        constrained_intra_pred: constrained_intra_pred != 0,
        transform_skip: transform_skip != 0,
        cu_qp_delta: cu_qp_delta != 0,
        weighted_prediction: weighted_prediction != 0,
        transquant_bypass: transquant_bypass != 0,
    })
}

fn decode_block_sizes(value: u32) -> Option<HevcBlockSizeCaps> {
    if value == sys::VA_ATTRIB_NOT_SUPPORTED {
        return None;
    }
    let mut bits = BitField::pack(value);
    let log2_max_ctb = bits.take(2);
    let log2_min_ctb = bits.take(2);
    let log2_min_cb = bits.take(2);
    let log2_max_tb = bits.take(2);
    let log2_min_tb = bits.take(2);
    let max_depth_inter = bits.take(3);
    let _min_depth_inter = bits.take(3);
    let max_depth_intra = bits.take(3);
    Some(HevcBlockSizeCaps {
        log2_max_coding_tree_block_size_minus3: log2_max_ctb as u8,
        log2_min_coding_tree_block_size_minus3: log2_min_ctb as u8,
        log2_min_luma_coding_block_size_minus3: log2_min_cb as u8,
        log2_max_luma_transform_block_size_minus2: log2_max_tb as u8,
        log2_min_luma_transform_block_size_minus2: log2_min_tb as u8,
        max_max_transform_hierarchy_depth_inter: max_depth_inter as u8,
        max_max_transform_hierarchy_depth_intra: max_depth_intra as u8,
    })
}

fn pic_ref_to_va(pic_ref: &PicRef) -> sys::VAPictureHEVC {
    if pic_ref.surface == SurfaceId::INVALID {
        return sys::VAPictureHEVC::invalid();
    }
    sys::VAPictureHEVC {
        picture_id: pic_ref.surface.0,
        pic_order_cnt: pic_ref.poc as i32,
        flags: pic_ref.flags,
        va_reserved: [0; 4],
    }
}

fn seq_to_va(seq: &SeqParams) -> sys::VAEncSequenceParameterBufferHEVC {
    let mut seq_fields = BitField::default();
    seq_fields
        .push(2, seq.chroma_format_idc.into())
        .push_flag(seq.separate_colour_plane)
        .push(3, seq.bit_depth_luma_minus8.into())
        .push(3, seq.bit_depth_chroma_minus8.into())
        .push_flag(seq.scaling_list_enabled)
        .push_flag(seq.strong_intra_smoothing_enabled)
        .push_flag(seq.amp_enabled)
        .push_flag(seq.sample_adaptive_offset_enabled)
        .push_flag(seq.pcm_enabled)
        .push_flag(false) // pcm_loop_filter_disabled_flag
        .push_flag(seq.temporal_mvp_enabled)
        .push_flag(false) // low_delay_seq
        .push_flag(false); // hierachical_flag

    sys::VAEncSequenceParameterBufferHEVC {
        general_profile_idc: seq.general_profile_idc,
        general_level_idc: seq.general_level_idc,
        general_tier_flag: seq.general_tier_flag.into(),
        intra_period: seq.intra_idr_period,
        intra_idr_period: seq.intra_idr_period,
        ip_period: seq.ip_period,
        bits_per_second: 0,
        pic_width_in_luma_samples: seq.pic_width_in_luma_samples,
        pic_height_in_luma_samples: seq.pic_height_in_luma_samples,
        seq_fields: seq_fields.value(),
        log2_min_luma_coding_block_size_minus3: seq.log2_min_luma_coding_block_size_minus3,
        log2_diff_max_min_luma_coding_block_size: seq.log2_diff_max_min_luma_coding_block_size,
        log2_min_transform_block_size_minus2: seq.log2_min_transform_block_size_minus2,
        log2_diff_max_min_transform_block_size: seq.log2_diff_max_min_transform_block_size,
        max_transform_hierarchy_depth_inter: seq.max_transform_hierarchy_depth_inter,
        max_transform_hierarchy_depth_intra: seq.max_transform_hierarchy_depth_intra,
        pcm_sample_bit_depth_luma_minus1: 0,
        pcm_sample_bit_depth_chroma_minus1: 0,
        log2_min_pcm_luma_coding_block_size_minus3: 0,
        log2_max_pcm_luma_coding_block_size_minus3: 0,
        // The packed SPS carries the VUI; the parameter buffer does not.
        vui_parameters_present_flag: 0,
        vui_fields: 0,
        aspect_ratio_idc: 0,
        sar_width: 0,
        sar_height: 0,
        vui_num_units_in_tick: seq.time_base_num,
        vui_time_scale: seq.time_base_den,
        min_spatial_segmentation_idc: 0,
        max_bytes_per_pic_denom: 0,
        max_bits_per_min_cu_denom: 0,
        log2_max_mv_length_horizontal: 15,
        log2_max_mv_length_vertical: 15,
        scc_fields: 0,
        va_reserved: [0; 8],
    }
}

fn pic_to_va(pic: &PicParams, coded_buffer: VABufferID) -> sys::VAEncPictureParameterBufferHEVC {
    let mut pic_fields = BitField::default();
    pic_fields
        .push_flag(pic.idr_pic)
        .push(3, pic.coding_type.into())
        .push_flag(pic.reference_pic)
        .push_flag(pic.dependent_slice_segments_enabled)
        .push_flag(pic.sign_data_hiding_enabled)
        .push_flag(pic.constrained_intra_pred)
        .push_flag(pic.transform_skip_enabled)
        .push_flag(pic.cu_qp_delta_enabled)
        .push_flag(pic.weighted_pred)
        .push_flag(pic.weighted_bipred)
        .push_flag(pic.transquant_bypass_enabled)
        .push_flag(pic.tiles_enabled)
        .push_flag(pic.entropy_coding_sync_enabled)
        .push_flag(false) // loop_filter_across_tiles_enabled_flag
        .push_flag(pic.loop_filter_across_slices_enabled)
        .push_flag(pic.scaling_list_data_present)
        .push_flag(false) // screen_content_flag
        .push_flag(false) // enable_gpu_weighted_prediction
        .push_flag(pic.no_output_of_prior_pics);

    let mut reference_frames = [sys::VAPictureHEVC::invalid(); 15];
    for (slot, pic_ref) in reference_frames.iter_mut().zip(pic.reference_frames.iter()) {
        *slot = pic_ref_to_va(pic_ref);
    }

    sys::VAEncPictureParameterBufferHEVC {
        decoded_curr_pic: pic_ref_to_va(&pic.decoded_curr_pic),
        reference_frames,
        coded_buf: coded_buffer,
        collocated_ref_pic_index: pic.collocated_ref_pic_index,
        last_picture: 0,
        pic_init_qp: pic.pic_init_qp,
        diff_cu_qp_delta_depth: pic.diff_cu_qp_delta_depth,
        pps_cb_qp_offset: pic.pps_cb_qp_offset,
        pps_cr_qp_offset: pic.pps_cr_qp_offset,
        num_tile_columns_minus1: 0,
        num_tile_rows_minus1: 0,
        column_width_minus1: [0; 19],
        row_height_minus1: [0; 21],
        ctu_max_bitsize_allowed: 0,
        num_ref_idx_l0_default_active_minus1: pic.num_ref_idx_l0_default_active_minus1,
        num_ref_idx_l1_default_active_minus1: pic.num_ref_idx_l1_default_active_minus1,
        slice_pic_parameter_set_id: pic.slice_pic_parameter_set_id,
        nal_unit_type: pic.nal_unit_type,
        pic_fields: pic_fields.value(),
        hierarchical_level_plus1: 0,
        va_byte_reserved: 0,
        screen_content_pic_fields: 0,
        va_reserved: [0; 8],
    }
}

fn slice_to_va(slice: &SliceParams) -> sys::VAEncSliceParameterBufferHEVC {
    let mut slice_fields = BitField::default();
    slice_fields
        .push_flag(slice.last_slice_of_pic)
        .push_flag(slice.dependent_slice_segment)
        .push(2, 0) // colour_plane_id
        .push_flag(slice.slice_temporal_mvp_enabled)
        .push_flag(slice.slice_sao_luma)
        .push_flag(slice.slice_sao_chroma)
        .push_flag(slice.num_ref_idx_active_override)
        .push_flag(slice.mvd_l1_zero)
        .push_flag(slice.cabac_init)
        .push(2, slice.slice_deblocking_filter_disabled.into())
        .push_flag(slice.slice_loop_filter_across_slices_enabled)
        .push_flag(slice.collocated_from_l0);

    let mut ref_pic_list0 = [sys::VAPictureHEVC::invalid(); 15];
    let mut ref_pic_list1 = [sys::VAPictureHEVC::invalid(); 15];
    for (slot, pic_ref) in ref_pic_list0.iter_mut().zip(slice.ref_pic_list0.iter()) {
        *slot = pic_ref_to_va(pic_ref);
    }
    for (slot, pic_ref) in ref_pic_list1.iter_mut().zip(slice.ref_pic_list1.iter()) {
        *slot = pic_ref_to_va(pic_ref);
    }

    sys::VAEncSliceParameterBufferHEVC {
        slice_segment_address: 0,
        num_ctu_in_slice: slice.num_ctu_in_slice,
        slice_type: slice.slice_type,
        slice_pic_parameter_set_id: slice.slice_pic_parameter_set_id,
        num_ref_idx_l0_active_minus1: slice.num_ref_idx_l0_active_minus1,
        num_ref_idx_l1_active_minus1: slice.num_ref_idx_l1_active_minus1,
        ref_pic_list0,
        ref_pic_list1,
        luma_log2_weight_denom: 0,
        delta_chroma_log2_weight_denom: 0,
        delta_luma_weight_l0: [0; 15],
        luma_offset_l0: [0; 15],
        delta_chroma_weight_l0: [[0; 2]; 15],
        chroma_offset_l0: [[0; 2]; 15],
        delta_luma_weight_l1: [0; 15],
        luma_offset_l1: [0; 15],
        delta_chroma_weight_l1: [[0; 2]; 15],
        chroma_offset_l1: [[0; 2]; 15],
        max_num_merge_cand: slice.max_num_merge_cand,
        slice_qp_delta: slice.slice_qp_delta,
        slice_cb_qp_offset: slice.slice_cb_qp_offset,
        slice_cr_qp_offset: slice.slice_cr_qp_offset,
        slice_beta_offset_div2: slice.slice_beta_offset_div2,
        slice_tc_offset_div2: slice.slice_tc_offset_div2,
        slice_fields: slice_fields.value(),
        pred_weight_table_bit_offset: 0,
        pred_weight_table_bit_length: 0,
        va_reserved: [0; 8],
    }
}
