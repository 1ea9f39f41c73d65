//! Frame header OBU parsing (AV1 § 5.9).
//!
//! This is where most of the stateful syntax lives: many fields are
//! predicted from one of the eight reference slots, so the parser gets a
//! read-only view of the headers currently held there.

use crate::bits::{poc_diff, Bits};
use crate::seqhdr::{AdaptiveMode, SequenceHeader, MAX_OPERATING_POINTS};
use crate::{Error, Result};

pub const REFS_PER_FRAME: usize = 7;
pub const NUM_REF_FRAMES: usize = 8;
pub const PRIMARY_REF_NONE: u8 = 7;
pub const MAX_SEGMENTS: usize = 8;
pub const MAX_TILE_COLS: u32 = 64;
pub const MAX_TILE_ROWS: u32 = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameType {
    #[default]
    Key,
    Inter,
    Intra,
    Switch,
}

impl FrameType {
    pub fn is_inter_or_switch(self) -> bool {
        matches!(self, FrameType::Inter | FrameType::Switch)
    }

    pub fn is_key_or_intra(self) -> bool {
        matches!(self, FrameType::Key | FrameType::Intra)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterMode {
    #[default]
    Regular8Tap,
    Smooth8Tap,
    Sharp8Tap,
    Bilinear,
    Switchable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TxfmMode {
    Only4x4,
    #[default]
    Largest,
    Switchable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum WarpMotionType {
    #[default]
    Identity,
    Translation,
    RotZoom,
    Affine,
}

/// Global motion for one reference: an affine transform in 16.16 fixed
/// point (the shear parameters are derived later, in the reconstruction
/// stage, and are not part of the bitstream).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WarpedMotionParams {
    pub kind: WarpMotionType,
    pub matrix: [i32; 6],
}

impl WarpedMotionParams {
    pub const IDENTITY: Self = Self {
        kind: WarpMotionType::Identity,
        matrix: [0, 0, 1 << 16, 0, 0, 1 << 16],
    };
}

impl Default for WarpedMotionParams {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SuperResInfo {
    pub enabled: bool,
    /// 9..=16 when enabled, 8 otherwise.
    pub width_scale_denominator: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileInfo {
    pub uniform: bool,
    pub n_bytes: u8,
    pub min_log2_cols: u8,
    pub max_log2_cols: u8,
    pub log2_cols: u8,
    pub cols: u16,
    pub min_log2_rows: u8,
    pub max_log2_rows: u8,
    pub log2_rows: u8,
    pub rows: u16,
    /// Tile start positions in superblocks, terminated by the frame size
    /// in superblocks as a sentinel.
    pub col_start_sb: [u16; MAX_TILE_COLS as usize + 1],
    pub row_start_sb: [u16; MAX_TILE_ROWS as usize + 1],
    /// Tile whose symbol decoder state seeds the frame-end CDF update.
    pub update: u16,
}

impl Default for TileInfo {
    fn default() -> Self {
        Self {
            uniform: false,
            n_bytes: 0,
            min_log2_cols: 0,
            max_log2_cols: 0,
            log2_cols: 0,
            cols: 0,
            min_log2_rows: 0,
            max_log2_rows: 0,
            log2_rows: 0,
            rows: 0,
            col_start_sb: [0; MAX_TILE_COLS as usize + 1],
            row_start_sb: [0; MAX_TILE_ROWS as usize + 1],
            update: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuantParams {
    pub yac: u8,
    pub ydc_delta: i8,
    pub udc_delta: i8,
    pub uac_delta: i8,
    pub vdc_delta: i8,
    pub vac_delta: i8,
    pub qm: bool,
    pub qm_y: u8,
    pub qm_u: u8,
    pub qm_v: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentationData {
    pub delta_q: i16,
    pub delta_lf_y_v: i8,
    pub delta_lf_y_h: i8,
    pub delta_lf_u: i8,
    pub delta_lf_v: i8,
    /// -1 when the feature is absent.
    pub ref_frame: i8,
    pub skip: bool,
    pub globalmv: bool,
}

impl Default for SegmentationData {
    fn default() -> Self {
        Self {
            delta_q: 0,
            delta_lf_y_v: 0,
            delta_lf_y_h: 0,
            delta_lf_u: 0,
            delta_lf_v: 0,
            ref_frame: -1,
            skip: false,
            globalmv: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentationDataSet {
    pub d: [SegmentationData; MAX_SEGMENTS],
    pub preskip: bool,
    pub last_active_segid: i8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentationParams {
    pub enabled: bool,
    pub update_map: bool,
    pub temporal: bool,
    pub update_data: bool,
    pub seg_data: SegmentationDataSet,
    pub lossless: [bool; MAX_SEGMENTS],
    pub qidx: [u8; MAX_SEGMENTS],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeltaQParams {
    pub present: bool,
    pub res_log2: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeltaLfParams {
    pub present: bool,
    pub res_log2: u8,
    pub multi: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeltaParams {
    pub q: DeltaQParams,
    pub lf: DeltaLfParams,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeRefDeltas {
    pub ref_delta: [i8; NUM_REF_FRAMES],
    pub mode_delta: [i8; 2],
}

impl Default for ModeRefDeltas {
    fn default() -> Self {
        Self {
            ref_delta: [1, 0, 0, 0, -1, 0, -1, -1],
            mode_delta: [0, 0],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopFilterParams {
    pub level_y: [u8; 2],
    pub level_u: u8,
    pub level_v: u8,
    pub mode_ref_delta_enabled: bool,
    pub mode_ref_delta_update: bool,
    pub mode_ref_deltas: ModeRefDeltas,
    pub sharpness: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CdefParams {
    pub damping: u8,
    pub n_bits: u8,
    pub y_strength: [u8; 8],
    pub uv_strength: [u8; 8],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RestorationType {
    #[default]
    None,
    Switchable,
    Wiener,
    SgrProj,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestorationParams {
    pub kind: [RestorationType; 3],
    /// log2 restoration unit size for luma and chroma.
    pub unit_size: [u8; 2],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilmGrainData {
    pub seed: u16,
    pub num_y_points: u8,
    pub y_points: [[u8; 2]; 14],
    pub chroma_scaling_from_luma: bool,
    pub num_uv_points: [u8; 2],
    pub uv_points: [[[u8; 2]; 10]; 2],
    pub scaling_shift: u8,
    pub ar_coeff_lag: u8,
    pub ar_coeffs_y: [i8; 24],
    pub ar_coeffs_uv: [[i8; 28]; 2],
    pub ar_coeff_shift: u8,
    pub grain_scale_shift: u8,
    pub uv_mult: [i8; 2],
    pub uv_luma_mult: [i8; 2],
    pub uv_offset: [i16; 2],
    pub overlap_flag: bool,
    pub clip_to_restricted_range: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilmGrainHeader {
    pub present: bool,
    pub update: bool,
    pub data: FilmGrainData,
}

/// One parsed frame header. Built up during the parse of a frame-header
/// (or frame) OBU and immutable once attached to a picture.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    /// Post-superres and pre-superres width.
    pub width: [u32; 2],
    pub height: u32,
    pub frame_offset: u32,
    pub temporal_id: u8,
    pub spatial_id: u8,
    pub show_existing_frame: bool,
    pub existing_frame_idx: u8,
    pub frame_id: u32,
    pub frame_presentation_delay: u32,
    pub show_frame: bool,
    pub showable_frame: bool,
    pub error_resilient_mode: bool,
    pub disable_cdf_update: bool,
    pub allow_screen_content_tools: bool,
    pub force_integer_mv: bool,
    pub frame_size_override: bool,
    pub primary_ref_frame: u8,
    pub buffer_removal_time_present: bool,
    pub buffer_removal_times: [u32; MAX_OPERATING_POINTS],
    pub refresh_frame_flags: u8,
    pub render_width: u32,
    pub render_height: u32,
    pub super_res: SuperResInfo,
    pub have_render_size: bool,
    pub allow_intrabc: bool,
    pub frame_ref_short_signaling: bool,
    pub refidx: [u8; REFS_PER_FRAME],
    pub hp: bool,
    pub subpel_filter_mode: FilterMode,
    pub switchable_motion_mode: bool,
    pub use_ref_frame_mvs: bool,
    pub refresh_context: bool,
    pub tiling: TileInfo,
    pub quant: QuantParams,
    pub segmentation: SegmentationParams,
    pub delta: DeltaParams,
    pub all_lossless: bool,
    pub loopfilter: LoopFilterParams,
    pub cdef: CdefParams,
    pub restoration: RestorationParams,
    pub txfm_mode: TxfmMode,
    pub switchable_comp_refs: bool,
    pub skip_mode_allowed: bool,
    pub skip_mode_enabled: bool,
    pub skip_mode_refs: [u8; 2],
    pub warp_motion: bool,
    pub reduced_txtp_set: bool,
    pub gmv: [WarpedMotionParams; REFS_PER_FRAME],
    pub film_grain: FilmGrainHeader,
}

fn iclip_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

fn tile_log2(sz: u32, tgt: u32) -> u8 {
    let mut k = 0;
    while (sz << k) < tgt {
        k += 1;
    }
    k
}

/// Frame-header parser bound to the sequence header and the reference
/// slot headers it predicts from.
pub(crate) struct FrameHeaderParser<'a> {
    pub seq: &'a SequenceHeader,
    pub refs: [Option<&'a FrameHeader>; NUM_REF_FRAMES],
}

impl<'a> FrameHeaderParser<'a> {
    fn ref_hdr(&self, slot: usize) -> Result<&'a FrameHeader> {
        self.refs[slot].ok_or(Error::InvalidData("empty reference slot"))
    }

    fn primary_ref_hdr(&self, hdr: &FrameHeader) -> Result<&'a FrameHeader> {
        debug_assert!(hdr.primary_ref_frame != PRIMARY_REF_NONE);
        self.ref_hdr(hdr.refidx[hdr.primary_ref_frame as usize] as usize)
    }

    pub fn parse(
        &self,
        b: &mut Bits<'_>,
        temporal_id: u8,
        spatial_id: u8,
    ) -> Result<FrameHeader> {
        let seq = self.seq;
        let mut hdr = FrameHeader {
            temporal_id,
            spatial_id,
            ..Default::default()
        };

        hdr.show_existing_frame = !seq.reduced_still_picture_header && b.bit()?;
        if hdr.show_existing_frame {
            hdr.existing_frame_idx = b.bits(3)? as u8;
            if seq.decoder_model_info_present && !seq.equal_picture_interval {
                hdr.frame_presentation_delay = b.bits(seq.frame_presentation_delay_length)?;
            }
            if seq.frame_id_numbers_present {
                hdr.frame_id = b.bits(seq.frame_id_n_bits)?;
                let ref_hdr = self.ref_hdr(hdr.existing_frame_idx as usize)?;
                if ref_hdr.frame_id != hdr.frame_id {
                    return Err(Error::InvalidData("display_frame_id"));
                }
            }
            return Ok(hdr);
        }

        hdr.frame_type = if seq.reduced_still_picture_header {
            FrameType::Key
        } else {
            match b.bits(2)? {
                0 => FrameType::Key,
                1 => FrameType::Inter,
                2 => FrameType::Intra,
                _ => FrameType::Switch,
            }
        };
        hdr.show_frame = seq.reduced_still_picture_header || b.bit()?;
        if hdr.show_frame {
            if seq.decoder_model_info_present && !seq.equal_picture_interval {
                hdr.frame_presentation_delay = b.bits(seq.frame_presentation_delay_length)?;
            }
            hdr.showable_frame = hdr.frame_type != FrameType::Key;
        } else {
            hdr.showable_frame = b.bit()?;
        }
        hdr.error_resilient_mode = (hdr.frame_type == FrameType::Key && hdr.show_frame)
            || hdr.frame_type == FrameType::Switch
            || seq.reduced_still_picture_header
            || b.bit()?;
        hdr.disable_cdf_update = b.bit()?;
        hdr.allow_screen_content_tools = match seq.screen_content_tools {
            AdaptiveMode::Adaptive => b.bit()?,
            mode => mode == AdaptiveMode::On,
        };
        if hdr.allow_screen_content_tools {
            hdr.force_integer_mv = match seq.force_integer_mv {
                AdaptiveMode::Adaptive => b.bit()?,
                mode => mode == AdaptiveMode::On,
            };
        }
        if hdr.frame_type.is_key_or_intra() {
            hdr.force_integer_mv = true;
        }
        if seq.frame_id_numbers_present {
            hdr.frame_id = b.bits(seq.frame_id_n_bits)?;
        }
        hdr.frame_size_override = if seq.reduced_still_picture_header {
            false
        } else if hdr.frame_type == FrameType::Switch {
            true
        } else {
            b.bit()?
        };
        hdr.frame_offset = if seq.order_hint {
            b.bits(seq.order_hint_n_bits)?
        } else {
            0
        };
        hdr.primary_ref_frame = if !hdr.error_resilient_mode && hdr.frame_type.is_inter_or_switch()
        {
            b.bits(3)? as u8
        } else {
            PRIMARY_REF_NONE
        };

        if seq.decoder_model_info_present {
            hdr.buffer_removal_time_present = b.bit()?;
            if hdr.buffer_removal_time_present {
                for (i, op) in seq.operating_points.iter().enumerate() {
                    if !op.decoder_model_param_present {
                        continue;
                    }
                    let in_temporal_layer = op.idc >> hdr.temporal_id & 1 != 0;
                    let in_spatial_layer = op.idc >> (hdr.spatial_id + 8) & 1 != 0;
                    if op.idc == 0 || (in_temporal_layer && in_spatial_layer) {
                        hdr.buffer_removal_times[i] = b.bits(seq.buffer_removal_delay_length)?;
                    }
                }
            }
        }

        if hdr.frame_type.is_key_or_intra() {
            hdr.refresh_frame_flags =
                if hdr.frame_type == FrameType::Key && hdr.show_frame {
                    0xff
                } else {
                    b.bits(8)? as u8
                };
            if hdr.frame_type == FrameType::Intra && hdr.refresh_frame_flags == 0xff {
                return Err(Error::InvalidData("intra frame refreshing all slots"));
            }
            if hdr.refresh_frame_flags != 0xff && hdr.error_resilient_mode && seq.order_hint {
                for _ in 0..NUM_REF_FRAMES {
                    b.bits(seq.order_hint_n_bits)?;
                }
            }
            self.read_frame_size(b, &mut hdr, false)?;
            hdr.allow_intrabc =
                hdr.allow_screen_content_tools && !hdr.super_res.enabled && b.bit()?;
            hdr.use_ref_frame_mvs = false;
        } else {
            hdr.allow_intrabc = false;
            hdr.refresh_frame_flags = if hdr.frame_type == FrameType::Switch {
                0xff
            } else {
                b.bits(8)? as u8
            };
            if hdr.error_resilient_mode && seq.order_hint {
                for _ in 0..NUM_REF_FRAMES {
                    b.bits(seq.order_hint_n_bits)?;
                }
            }
            hdr.frame_ref_short_signaling = seq.order_hint && b.bit()?;
            if hdr.frame_ref_short_signaling {
                self.set_frame_refs(b, &mut hdr)?;
            }
            for i in 0..REFS_PER_FRAME {
                if !hdr.frame_ref_short_signaling {
                    hdr.refidx[i] = b.bits(3)? as u8;
                }
                if seq.frame_id_numbers_present {
                    let delta_ref_frame_id = b.bits(seq.delta_frame_id_n_bits)? + 1;
                    let ref_frame_id = hdr
                        .frame_id
                        .wrapping_add(1 << seq.frame_id_n_bits)
                        .wrapping_sub(delta_ref_frame_id)
                        & ((1 << seq.frame_id_n_bits) - 1);
                    let ref_hdr = self.ref_hdr(hdr.refidx[i] as usize)?;
                    if ref_hdr.frame_id != ref_frame_id {
                        return Err(Error::InvalidData("ref frame_id"));
                    }
                }
            }
            let use_ref = !hdr.error_resilient_mode && hdr.frame_size_override;
            self.read_frame_size(b, &mut hdr, use_ref)?;
            hdr.hp = !hdr.force_integer_mv && b.bit()?;
            hdr.subpel_filter_mode = if b.bit()? {
                FilterMode::Switchable
            } else {
                match b.bits(2)? {
                    0 => FilterMode::Regular8Tap,
                    1 => FilterMode::Smooth8Tap,
                    2 => FilterMode::Sharp8Tap,
                    _ => FilterMode::Bilinear,
                }
            };
            hdr.switchable_motion_mode = b.bit()?;
            hdr.use_ref_frame_mvs = !hdr.error_resilient_mode
                && seq.ref_frame_mvs
                && seq.order_hint
                && hdr.frame_type.is_inter_or_switch()
                && b.bit()?;
        }

        hdr.refresh_context =
            !seq.reduced_still_picture_header && !hdr.disable_cdf_update && !b.bit()?;

        self.read_tile_info(b, &mut hdr)?;
        self.read_quant(b, &mut hdr)?;
        self.read_segmentation(b, &mut hdr)?;
        self.read_delta(b, &mut hdr)?;
        derive_lossless(&mut hdr);
        self.read_loopfilter(b, &mut hdr)?;
        self.read_cdef(b, &mut hdr)?;
        self.read_restoration(b, &mut hdr)?;

        hdr.txfm_mode = if hdr.all_lossless {
            TxfmMode::Only4x4
        } else if b.bit()? {
            TxfmMode::Switchable
        } else {
            TxfmMode::Largest
        };
        hdr.switchable_comp_refs = if hdr.frame_type.is_inter_or_switch() {
            b.bit()?
        } else {
            false
        };
        self.read_skip_mode(b, &mut hdr)?;
        hdr.warp_motion = !hdr.error_resilient_mode
            && hdr.frame_type.is_inter_or_switch()
            && seq.warped_motion
            && b.bit()?;
        hdr.reduced_txtp_set = b.bit()?;
        self.read_global_motion(b, &mut hdr)?;
        self.read_film_grain(b, &mut hdr)?;

        Ok(hdr)
    }

    fn read_frame_size(&self, b: &mut Bits<'_>, hdr: &mut FrameHeader, use_ref: bool) -> Result<()> {
        let seq = self.seq;
        if use_ref {
            for i in 0..REFS_PER_FRAME {
                if !b.bit()? {
                    continue;
                }
                let ref_hdr = self.ref_hdr(hdr.refidx[i] as usize)?;
                hdr.width[1] = ref_hdr.width[1];
                hdr.height = ref_hdr.height;
                hdr.render_width = ref_hdr.render_width;
                hdr.render_height = ref_hdr.render_height;
                hdr.super_res.enabled = seq.super_res && b.bit()?;
                if hdr.super_res.enabled {
                    let d = 9 + b.bits(3)? as u8;
                    hdr.super_res.width_scale_denominator = d;
                    let d = u32::from(d);
                    hdr.width[0] =
                        ((hdr.width[1] * 8 + (d >> 1)) / d).max(hdr.width[1].min(16));
                } else {
                    hdr.super_res.width_scale_denominator = 8;
                    hdr.width[0] = hdr.width[1];
                }
                return Ok(());
            }
        }
        if hdr.frame_size_override {
            hdr.width[1] = b.bits(seq.width_n_bits)? + 1;
            hdr.height = b.bits(seq.height_n_bits)? + 1;
        } else {
            hdr.width[1] = seq.max_width;
            hdr.height = seq.max_height;
        }
        hdr.super_res.enabled = seq.super_res && b.bit()?;
        if hdr.super_res.enabled {
            let d = 9 + b.bits(3)? as u8;
            hdr.super_res.width_scale_denominator = d;
            let d = u32::from(d);
            hdr.width[0] = ((hdr.width[1] * 8 + (d >> 1)) / d).max(hdr.width[1].min(16));
        } else {
            hdr.super_res.width_scale_denominator = 8;
            hdr.width[0] = hdr.width[1];
        }
        hdr.have_render_size = b.bit()?;
        if hdr.have_render_size {
            hdr.render_width = b.bits(16)? + 1;
            hdr.render_height = b.bits(16)? + 1;
        } else {
            hdr.render_width = hdr.width[1];
            hdr.render_height = hdr.height;
        }
        Ok(())
    }

    /// Derives refidx[1..7] from the two signaled references and the order
    /// hints stored in the slots. The hints are shifted so the current
    /// frame sits at the middle of the order-hint range; selection then
    /// works on plain unsigned values, with the overall earliest reference
    /// reserved as the fallback for positions nothing else fits.
    fn set_frame_refs(&self, b: &mut Bits<'_>, hdr: &mut FrameHeader) -> Result<()> {
        let seq = self.seq;
        let n = seq.order_hint_n_bits;
        let cur = 1u32 << (n - 1);

        let idx0 = b.bits(3)? as usize;
        let idx3 = b.bits(3)? as usize;

        let mut hint = [0u32; NUM_REF_FRAMES];
        for (i, h) in hint.iter_mut().enumerate() {
            let ref_hdr = self.ref_hdr(i)?;
            *h = (cur as i32 + poc_diff(n, ref_hdr.frame_offset, hdr.frame_offset)) as u32;
        }

        let mut used = [false; NUM_REF_FRAMES];
        used[idx0] = true;
        used[idx3] = true;

        let mut earliest_ref = 0;
        for i in 1..NUM_REF_FRAMES {
            if hint[i] < hint[earliest_ref] {
                earliest_ref = i;
            }
        }
        used[earliest_ref] = true;

        let mut refidx: [Option<usize>; REFS_PER_FRAME] = [None; REFS_PER_FRAME];
        refidx[0] = Some(idx0);
        refidx[3] = Some(idx3);

        // refidx[6]: the latest still-unused reference
        let mut latest = 0u32;
        for i in 0..NUM_REF_FRAMES {
            if !used[i] && hint[i] >= latest {
                refidx[6] = Some(i);
                latest = hint[i];
            }
        }
        if let Some(i) = refidx[6] {
            used[i] = true;
        }

        // refidx[4] and refidx[5]: the two earliest of what remains
        for pos in 4..6 {
            let mut earliest = u32::MAX;
            for i in 0..NUM_REF_FRAMES {
                if !used[i] && hint[i] < earliest {
                    refidx[pos] = Some(i);
                    earliest = hint[i];
                }
            }
            if let Some(i) = refidx[pos] {
                used[i] = true;
            }
        }

        // everything else takes the latest of what is left, and the
        // reserved earliest reference fills any remaining hole
        for pos in 1..REFS_PER_FRAME {
            if refidx[pos].is_some() {
                continue;
            }
            let mut latest = 0u32;
            let mut pick = None;
            for i in 0..NUM_REF_FRAMES {
                if !used[i] && hint[i] >= latest {
                    pick = Some(i);
                    latest = hint[i];
                }
            }
            if let Some(i) = pick {
                used[i] = true;
            }
            refidx[pos] = Some(pick.unwrap_or(earliest_ref));
        }

        for (dst, src) in hdr.refidx.iter_mut().zip(refidx) {
            *dst = src.unwrap_or(earliest_ref as usize) as u8;
        }
        Ok(())
    }

    fn read_tile_info(&self, b: &mut Bits<'_>, hdr: &mut FrameHeader) -> Result<()> {
        let seq = self.seq;
        let sbsz_log2 = 6 + u32::from(seq.sb128);
        let sbsz_min1 = (1 << sbsz_log2) - 1;
        let sbw = (hdr.width[0] + sbsz_min1) >> sbsz_log2;
        let sbh = (hdr.height + sbsz_min1) >> sbsz_log2;
        let max_tile_width_sb = 4096 >> sbsz_log2;
        let max_tile_area_sb = (4096 * 2304) >> (2 * sbsz_log2);
        let t = &mut hdr.tiling;

        t.min_log2_cols = tile_log2(max_tile_width_sb, sbw);
        t.max_log2_cols = tile_log2(1, sbw.min(MAX_TILE_COLS));
        t.max_log2_rows = tile_log2(1, sbh.min(MAX_TILE_ROWS));
        let min_log2_tiles = tile_log2(max_tile_area_sb, sbw * sbh).max(t.min_log2_cols);

        t.uniform = b.bit()?;
        if t.uniform {
            t.log2_cols = t.min_log2_cols;
            while t.log2_cols < t.max_log2_cols && b.bit()? {
                t.log2_cols += 1;
            }
            let tile_w = 1 + ((sbw - 1) >> t.log2_cols);
            t.cols = 0;
            let mut sbx = 0;
            while sbx < sbw {
                t.col_start_sb[t.cols as usize] = sbx as u16;
                sbx += tile_w;
                t.cols += 1;
            }
            t.min_log2_rows = min_log2_tiles.saturating_sub(t.log2_cols);

            t.log2_rows = t.min_log2_rows;
            while t.log2_rows < t.max_log2_rows && b.bit()? {
                t.log2_rows += 1;
            }
            let tile_h = 1 + ((sbh - 1) >> t.log2_rows);
            t.rows = 0;
            let mut sby = 0;
            while sby < sbh {
                t.row_start_sb[t.rows as usize] = sby as u16;
                sby += tile_h;
                t.rows += 1;
            }
        } else {
            t.cols = 0;
            let mut widest_tile = 0;
            // a second area cap, recomputed against the widest tile read
            // so far; distinct from the sequence-level cap above
            let mut max_tile_area_sb = sbw * sbh;
            let mut sbx = 0;
            while sbx < sbw && u32::from(t.cols) < MAX_TILE_COLS {
                let tile_width_sb = (sbw - sbx).min(max_tile_width_sb);
                let tile_w = if tile_width_sb > 1 {
                    1 + b.uniform(tile_width_sb)?
                } else {
                    1
                };
                t.col_start_sb[t.cols as usize] = sbx as u16;
                sbx += tile_w;
                widest_tile = widest_tile.max(tile_w);
                t.cols += 1;
            }
            if sbx < sbw {
                return Err(Error::InvalidData("tile columns"));
            }
            t.log2_cols = tile_log2(1, u32::from(t.cols));
            if min_log2_tiles != 0 {
                max_tile_area_sb >>= min_log2_tiles + 1;
            }
            let max_tile_height_sb = (max_tile_area_sb / widest_tile).max(1);

            t.rows = 0;
            let mut sby = 0;
            while sby < sbh && u32::from(t.rows) < MAX_TILE_ROWS {
                let tile_height_sb = (sbh - sby).min(max_tile_height_sb);
                let tile_h = if tile_height_sb > 1 {
                    1 + b.uniform(tile_height_sb)?
                } else {
                    1
                };
                t.row_start_sb[t.rows as usize] = sby as u16;
                sby += tile_h;
                t.rows += 1;
            }
            if sby < sbh {
                return Err(Error::InvalidData("tile rows"));
            }
            t.log2_rows = tile_log2(1, u32::from(t.rows));
        }
        t.col_start_sb[t.cols as usize] = sbw as u16;
        t.row_start_sb[t.rows as usize] = sbh as u16;
        if t.log2_cols != 0 || t.log2_rows != 0 {
            t.update = b.bits(t.log2_cols + t.log2_rows)? as u16;
            if u32::from(t.update) >= u32::from(t.cols) * u32::from(t.rows) {
                return Err(Error::InvalidData("context_update_tile_id"));
            }
            t.n_bytes = b.bits(2)? as u8 + 1;
        } else {
            t.n_bytes = 0;
            t.update = 0;
        }
        Ok(())
    }

    fn read_quant(&self, b: &mut Bits<'_>, hdr: &mut FrameHeader) -> Result<()> {
        let seq = self.seq;
        let q = &mut hdr.quant;
        q.yac = b.bits(8)? as u8;
        q.ydc_delta = if b.bit()? { b.sbits(7)? as i8 } else { 0 };
        if !seq.monochrome {
            let diff_uv_delta = seq.separate_uv_delta_q && b.bit()?;
            q.udc_delta = if b.bit()? { b.sbits(7)? as i8 } else { 0 };
            q.uac_delta = if b.bit()? { b.sbits(7)? as i8 } else { 0 };
            if diff_uv_delta {
                q.vdc_delta = if b.bit()? { b.sbits(7)? as i8 } else { 0 };
                q.vac_delta = if b.bit()? { b.sbits(7)? as i8 } else { 0 };
            } else {
                q.vdc_delta = q.udc_delta;
                q.vac_delta = q.uac_delta;
            }
        }
        q.qm = b.bit()?;
        if q.qm {
            q.qm_y = b.bits(4)? as u8;
            q.qm_u = b.bits(4)? as u8;
            q.qm_v = if seq.separate_uv_delta_q {
                b.bits(4)? as u8
            } else {
                q.qm_u
            };
        }
        Ok(())
    }

    fn read_segmentation(&self, b: &mut Bits<'_>, hdr: &mut FrameHeader) -> Result<()> {
        let seg_enabled = b.bit()?;
        hdr.segmentation.enabled = seg_enabled;
        if seg_enabled {
            if hdr.primary_ref_frame == PRIMARY_REF_NONE {
                hdr.segmentation.update_map = true;
                hdr.segmentation.temporal = false;
                hdr.segmentation.update_data = true;
            } else {
                hdr.segmentation.update_map = b.bit()?;
                hdr.segmentation.temporal = hdr.segmentation.update_map && b.bit()?;
                hdr.segmentation.update_data = b.bit()?;
            }

            if hdr.segmentation.update_data {
                let set = &mut hdr.segmentation.seg_data;
                set.last_active_segid = -1;
                set.preskip = false;
                for i in 0..MAX_SEGMENTS {
                    let seg = &mut set.d[i];
                    if b.bit()? {
                        seg.delta_q = b.sbits(9)? as i16;
                        set.last_active_segid = i as i8;
                    }
                    if b.bit()? {
                        seg.delta_lf_y_v = b.sbits(7)? as i8;
                        set.last_active_segid = i as i8;
                    }
                    if b.bit()? {
                        seg.delta_lf_y_h = b.sbits(7)? as i8;
                        set.last_active_segid = i as i8;
                    }
                    if b.bit()? {
                        seg.delta_lf_u = b.sbits(7)? as i8;
                        set.last_active_segid = i as i8;
                    }
                    if b.bit()? {
                        seg.delta_lf_v = b.sbits(7)? as i8;
                        set.last_active_segid = i as i8;
                    }
                    if b.bit()? {
                        seg.ref_frame = b.bits(3)? as i8;
                        set.last_active_segid = i as i8;
                        set.preskip = true;
                    }
                    seg.skip = b.bit()?;
                    if seg.skip {
                        set.last_active_segid = i as i8;
                        set.preskip = true;
                    }
                    seg.globalmv = b.bit()?;
                    if seg.globalmv {
                        set.last_active_segid = i as i8;
                        set.preskip = true;
                    }
                }
            } else {
                // inherit the whole data set from the primary reference
                hdr.segmentation.seg_data = self.primary_ref_hdr(hdr)?.segmentation.seg_data;
            }
        } else {
            hdr.segmentation.seg_data = SegmentationDataSet::default();
        }
        Ok(())
    }

    fn read_delta(&self, b: &mut Bits<'_>, hdr: &mut FrameHeader) -> Result<()> {
        hdr.delta.q.present = hdr.quant.yac != 0 && b.bit()?;
        hdr.delta.q.res_log2 = if hdr.delta.q.present {
            b.bits(2)? as u8
        } else {
            0
        };
        hdr.delta.lf.present = hdr.delta.q.present && !hdr.allow_intrabc && b.bit()?;
        hdr.delta.lf.res_log2 = if hdr.delta.lf.present {
            b.bits(2)? as u8
        } else {
            0
        };
        hdr.delta.lf.multi = hdr.delta.lf.present && b.bit()?;
        Ok(())
    }

    fn read_loopfilter(&self, b: &mut Bits<'_>, hdr: &mut FrameHeader) -> Result<()> {
        if hdr.all_lossless || hdr.allow_intrabc {
            let lf = &mut hdr.loopfilter;
            lf.level_y = [0, 0];
            lf.level_u = 0;
            lf.level_v = 0;
            lf.sharpness = 0;
            lf.mode_ref_delta_enabled = true;
            lf.mode_ref_delta_update = true;
            lf.mode_ref_deltas = ModeRefDeltas::default();
            return Ok(());
        }
        let mode_ref_deltas = if hdr.primary_ref_frame == PRIMARY_REF_NONE {
            ModeRefDeltas::default()
        } else {
            self.primary_ref_hdr(hdr)?.loopfilter.mode_ref_deltas
        };
        let lf = &mut hdr.loopfilter;
        lf.level_y[0] = b.bits(6)? as u8;
        lf.level_y[1] = b.bits(6)? as u8;
        if !self.seq.monochrome && (lf.level_y[0] != 0 || lf.level_y[1] != 0) {
            lf.level_u = b.bits(6)? as u8;
            lf.level_v = b.bits(6)? as u8;
        }
        lf.sharpness = b.bits(3)? as u8;

        lf.mode_ref_deltas = mode_ref_deltas;
        lf.mode_ref_delta_enabled = b.bit()?;
        if lf.mode_ref_delta_enabled {
            lf.mode_ref_delta_update = b.bit()?;
            if lf.mode_ref_delta_update {
                for i in 0..NUM_REF_FRAMES {
                    if b.bit()? {
                        lf.mode_ref_deltas.ref_delta[i] = b.sbits(7)? as i8;
                    }
                }
                for i in 0..2 {
                    if b.bit()? {
                        lf.mode_ref_deltas.mode_delta[i] = b.sbits(7)? as i8;
                    }
                }
            }
        }
        Ok(())
    }

    fn read_cdef(&self, b: &mut Bits<'_>, hdr: &mut FrameHeader) -> Result<()> {
        if !hdr.all_lossless && self.seq.cdef && !hdr.allow_intrabc {
            hdr.cdef.damping = b.bits(2)? as u8 + 3;
            hdr.cdef.n_bits = b.bits(2)? as u8;
            for i in 0..(1usize << hdr.cdef.n_bits) {
                hdr.cdef.y_strength[i] = b.bits(6)? as u8;
                if !self.seq.monochrome {
                    hdr.cdef.uv_strength[i] = b.bits(6)? as u8;
                }
            }
        } else {
            hdr.cdef.n_bits = 0;
            hdr.cdef.y_strength[0] = 0;
            hdr.cdef.uv_strength[0] = 0;
        }
        Ok(())
    }

    fn read_restoration(&self, b: &mut Bits<'_>, hdr: &mut FrameHeader) -> Result<()> {
        let seq = self.seq;
        let r = &mut hdr.restoration;
        if (!hdr.all_lossless || hdr.super_res.enabled) && seq.restoration && !hdr.allow_intrabc {
            let kind = |v: u32| match v {
                0 => RestorationType::None,
                1 => RestorationType::Switchable,
                2 => RestorationType::Wiener,
                _ => RestorationType::SgrProj,
            };
            r.kind[0] = kind(b.bits(2)?);
            if !seq.monochrome {
                r.kind[1] = kind(b.bits(2)?);
                r.kind[2] = kind(b.bits(2)?);
            }

            if r.kind.iter().any(|&k| k != RestorationType::None) {
                r.unit_size[0] = 6 + u8::from(seq.sb128);
                if b.bit()? {
                    r.unit_size[0] += 1;
                    if !seq.sb128 {
                        r.unit_size[0] += u8::from(b.bit()?);
                    }
                }
                r.unit_size[1] = r.unit_size[0];
                if (r.kind[1] != RestorationType::None || r.kind[2] != RestorationType::None)
                    && seq.ss_hor == 1
                    && seq.ss_ver == 1
                {
                    r.unit_size[1] -= u8::from(b.bit()?);
                }
            } else {
                r.unit_size[0] = 8;
            }
        } else {
            r.kind = [RestorationType::None; 3];
        }
        Ok(())
    }

    fn read_skip_mode(&self, b: &mut Bits<'_>, hdr: &mut FrameHeader) -> Result<()> {
        let seq = self.seq;
        hdr.skip_mode_allowed = false;
        if hdr.switchable_comp_refs && hdr.frame_type.is_inter_or_switch() && seq.order_hint {
            let poc = hdr.frame_offset;
            let mut off_before: Option<(u32, usize)> = None;
            let mut off_after: Option<(u32, usize)> = None;
            for i in 0..REFS_PER_FRAME {
                let refpoc = self.ref_hdr(hdr.refidx[i] as usize)?.frame_offset;
                let diff = poc_diff(seq.order_hint_n_bits, refpoc, poc);
                if diff > 0 {
                    if off_after.map_or(true, |(after, _)| {
                        poc_diff(seq.order_hint_n_bits, after, refpoc) > 0
                    }) {
                        off_after = Some((refpoc, i));
                    }
                } else if diff < 0
                    && off_before.map_or(true, |(before, _)| {
                        poc_diff(seq.order_hint_n_bits, before, refpoc) < 0
                    })
                {
                    off_before = Some((refpoc, i));
                }
            }

            if let (Some((_, before_idx)), Some((_, after_idx))) = (off_before, off_after) {
                hdr.skip_mode_refs[0] = before_idx.min(after_idx) as u8;
                hdr.skip_mode_refs[1] = before_idx.max(after_idx) as u8;
                hdr.skip_mode_allowed = true;
            } else if let Some((before, before_idx)) = off_before {
                // no future reference; pair the two closest past ones
                let mut off_before2: Option<(u32, usize)> = None;
                for i in 0..REFS_PER_FRAME {
                    let refpoc = self.ref_hdr(hdr.refidx[i] as usize)?.frame_offset;
                    if poc_diff(seq.order_hint_n_bits, refpoc, before) < 0
                        && off_before2.map_or(true, |(before2, _)| {
                            poc_diff(seq.order_hint_n_bits, refpoc, before2) > 0
                        })
                    {
                        off_before2 = Some((refpoc, i));
                    }
                }
                if let Some((_, before2_idx)) = off_before2 {
                    hdr.skip_mode_refs[0] = before_idx.min(before2_idx) as u8;
                    hdr.skip_mode_refs[1] = before_idx.max(before2_idx) as u8;
                    hdr.skip_mode_allowed = true;
                }
            }
        }
        hdr.skip_mode_enabled = hdr.skip_mode_allowed && b.bit()?;
        Ok(())
    }

    fn read_global_motion(&self, b: &mut Bits<'_>, hdr: &mut FrameHeader) -> Result<()> {
        hdr.gmv = [WarpedMotionParams::IDENTITY; REFS_PER_FRAME];
        if !hdr.frame_type.is_inter_or_switch() {
            return Ok(());
        }
        for i in 0..REFS_PER_FRAME {
            let kind = if !b.bit()? {
                WarpMotionType::Identity
            } else if b.bit()? {
                WarpMotionType::RotZoom
            } else if b.bit()? {
                WarpMotionType::Translation
            } else {
                WarpMotionType::Affine
            };
            hdr.gmv[i].kind = kind;
            if kind == WarpMotionType::Identity {
                continue;
            }

            let ref_mat = if hdr.primary_ref_frame == PRIMARY_REF_NONE {
                WarpedMotionParams::IDENTITY.matrix
            } else {
                self.primary_ref_hdr(hdr)?.gmv[i].matrix
            };
            let mat = &mut hdr.gmv[i].matrix;

            let bits;
            let shift;
            if kind >= WarpMotionType::RotZoom {
                mat[2] = (1 << 16) + 2 * b.subexp((ref_mat[2] - (1 << 16)) >> 1, 12)?;
                mat[3] = 2 * b.subexp(ref_mat[3] >> 1, 12)?;
                bits = 12;
                shift = 10;
            } else {
                bits = 9 - u8::from(!hdr.hp);
                shift = 13 + u8::from(!hdr.hp);
            }
            if kind == WarpMotionType::Affine {
                mat[4] = 2 * b.subexp(ref_mat[4] >> 1, 12)?;
                mat[5] = (1 << 16) + 2 * b.subexp((ref_mat[5] - (1 << 16)) >> 1, 12)?;
            } else {
                mat[4] = -mat[3];
                mat[5] = mat[2];
            }
            mat[0] = b.subexp(ref_mat[0] >> shift, bits)? * (1 << shift);
            mat[1] = b.subexp(ref_mat[1] >> shift, bits)? * (1 << shift);
        }
        Ok(())
    }

    fn read_film_grain(&self, b: &mut Bits<'_>, hdr: &mut FrameHeader) -> Result<()> {
        let seq = self.seq;
        if !seq.film_grain_present || (!hdr.show_frame && !hdr.showable_frame) {
            hdr.film_grain = FilmGrainHeader::default();
            return Ok(());
        }
        hdr.film_grain.present = b.bit()?;
        if !hdr.film_grain.present {
            return Ok(());
        }

        let seed = b.bits(16)? as u16;
        hdr.film_grain.update = hdr.frame_type != FrameType::Inter || b.bit()?;
        if !hdr.film_grain.update {
            let ref_slot = b.bits(3)? as u8;
            if !hdr.refidx.contains(&ref_slot) {
                return Err(Error::InvalidData("film_grain_params_ref_idx"));
            }
            hdr.film_grain.data = self.ref_hdr(ref_slot as usize)?.film_grain.data;
            hdr.film_grain.data.seed = seed;
            return Ok(());
        }

        let fgd = &mut hdr.film_grain.data;
        fgd.seed = seed;
        fgd.num_y_points = b.bits(4)? as u8;
        if fgd.num_y_points > 14 {
            return Err(Error::InvalidData("num_y_points"));
        }
        for i in 0..fgd.num_y_points as usize {
            fgd.y_points[i][0] = b.bits(8)? as u8;
            if i != 0 && fgd.y_points[i - 1][0] >= fgd.y_points[i][0] {
                return Err(Error::InvalidData("y_points"));
            }
            fgd.y_points[i][1] = b.bits(8)? as u8;
        }

        fgd.chroma_scaling_from_luma = !seq.monochrome && b.bit()?;
        if seq.monochrome
            || fgd.chroma_scaling_from_luma
            || (seq.ss_ver == 1 && seq.ss_hor == 1 && fgd.num_y_points == 0)
        {
            fgd.num_uv_points = [0, 0];
        } else {
            for pl in 0..2 {
                fgd.num_uv_points[pl] = b.bits(4)? as u8;
                if fgd.num_uv_points[pl] > 10 {
                    return Err(Error::InvalidData("num_uv_points"));
                }
                for i in 0..fgd.num_uv_points[pl] as usize {
                    fgd.uv_points[pl][i][0] = b.bits(8)? as u8;
                    if i != 0 && fgd.uv_points[pl][i - 1][0] >= fgd.uv_points[pl][i][0] {
                        return Err(Error::InvalidData("uv_points"));
                    }
                    fgd.uv_points[pl][i][1] = b.bits(8)? as u8;
                }
            }
        }

        if seq.ss_hor == 1
            && seq.ss_ver == 1
            && (fgd.num_uv_points[0] == 0) != (fgd.num_uv_points[1] == 0)
        {
            return Err(Error::InvalidData("chroma scaling points"));
        }

        fgd.scaling_shift = b.bits(2)? as u8 + 8;
        fgd.ar_coeff_lag = b.bits(2)? as u8;
        let num_y_pos = 2 * fgd.ar_coeff_lag as usize * (fgd.ar_coeff_lag as usize + 1);
        if fgd.num_y_points != 0 {
            for i in 0..num_y_pos {
                fgd.ar_coeffs_y[i] = (b.bits(8)? as i32 - 128) as i8;
            }
        }
        for pl in 0..2 {
            if fgd.num_uv_points[pl] != 0 || fgd.chroma_scaling_from_luma {
                let num_uv_pos = num_y_pos + usize::from(fgd.num_y_points != 0);
                for i in 0..num_uv_pos {
                    fgd.ar_coeffs_uv[pl][i] = (b.bits(8)? as i32 - 128) as i8;
                }
                if fgd.num_y_points == 0 {
                    fgd.ar_coeffs_uv[pl][num_uv_pos] = 0;
                }
            }
        }
        fgd.ar_coeff_shift = b.bits(2)? as u8 + 6;
        fgd.grain_scale_shift = b.bits(2)? as u8;
        for pl in 0..2 {
            if fgd.num_uv_points[pl] != 0 {
                fgd.uv_mult[pl] = (b.bits(8)? as i32 - 128) as i8;
                fgd.uv_luma_mult[pl] = (b.bits(8)? as i32 - 128) as i8;
                fgd.uv_offset[pl] = (b.bits(9)? as i32 - 256) as i16;
            }
        }
        fgd.overlap_flag = b.bit()?;
        fgd.clip_to_restricted_range = b.bit()?;
        Ok(())
    }
}

/// Per-segment quantizer indices and the lossless flags derived from them.
fn derive_lossless(hdr: &mut FrameHeader) {
    let q = &hdr.quant;
    let delta_free =
        q.ydc_delta == 0 && q.udc_delta == 0 && q.uac_delta == 0 && q.vdc_delta == 0 && q.vac_delta == 0;
    hdr.all_lossless = true;
    for i in 0..MAX_SEGMENTS {
        hdr.segmentation.qidx[i] = if hdr.segmentation.enabled {
            iclip_u8(i32::from(q.yac) + i32::from(hdr.segmentation.seg_data.d[i].delta_q))
        } else {
            q.yac
        };
        hdr.segmentation.lossless[i] = hdr.segmentation.qidx[i] == 0 && delta_free;
        hdr.all_lossless &= hdr.segmentation.lossless[i];
    }
}
