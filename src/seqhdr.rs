//! Sequence header OBU parsing (AV1 § 5.5).

use crate::bits::Bits;
use crate::{Error, Result};
use arrayvec::ArrayVec;

pub const MAX_OPERATING_POINTS: usize = 32;

// CICP code points the parser has to recognize by value.
pub const COLOR_PRI_BT709: u8 = 1;
pub const COLOR_PRI_UNKNOWN: u8 = 2;
pub const TRC_UNKNOWN: u8 = 2;
pub const TRC_SRGB: u8 = 13;
pub const MC_IDENTITY: u8 = 0;
pub const MC_UNKNOWN: u8 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelLayout {
    I400,
    #[default]
    I420,
    I422,
    I444,
}

/// Chroma sample position for subsampled layouts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChromaSamplePosition {
    #[default]
    Unknown,
    Vertical,
    Colocated,
}

/// Off/on toggles that a sequence header may defer to each frame header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AdaptiveMode {
    #[default]
    Off,
    On,
    /// The per-frame bit is coded; also the placeholder for "absent".
    Adaptive,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperatingPoint {
    pub idc: u16,
    pub major_level: u8,
    pub minor_level: u8,
    pub tier: u8,
    pub decoder_model_param_present: bool,
    pub display_model_param_present: bool,
    pub initial_display_delay: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperatingParameterInfo {
    pub decoder_buffer_delay: u32,
    pub encoder_buffer_delay: u32,
    pub low_delay_mode: bool,
}

/// One parsed sequence header. Immutable once published; a new sequence
/// header OBU always produces a fresh descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceHeader {
    pub profile: u8,
    pub max_width: u32,
    pub max_height: u32,
    pub layout: PixelLayout,
    pub pri: u8,
    pub trc: u8,
    pub mtrx: u8,
    pub chr: ChromaSamplePosition,
    pub bit_depth: u8,
    pub monochrome: bool,
    pub color_description_present: bool,
    pub color_range: bool,
    pub still_picture: bool,
    pub reduced_still_picture_header: bool,
    pub timing_info_present: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub equal_picture_interval: bool,
    pub num_ticks_per_picture: u32,
    pub decoder_model_info_present: bool,
    pub encoder_decoder_buffer_delay_length: u8,
    pub num_units_in_decoding_tick: u32,
    pub buffer_removal_delay_length: u8,
    pub frame_presentation_delay_length: u8,
    pub display_model_info_present: bool,
    pub operating_points: ArrayVec<OperatingPoint, MAX_OPERATING_POINTS>,
    pub width_n_bits: u8,
    pub height_n_bits: u8,
    pub frame_id_numbers_present: bool,
    pub delta_frame_id_n_bits: u8,
    pub frame_id_n_bits: u8,
    pub sb128: bool,
    pub filter_intra: bool,
    pub intra_edge_filter: bool,
    pub inter_intra: bool,
    pub masked_compound: bool,
    pub warped_motion: bool,
    pub dual_filter: bool,
    pub order_hint: bool,
    pub jnt_comp: bool,
    pub ref_frame_mvs: bool,
    pub screen_content_tools: AdaptiveMode,
    pub force_integer_mv: AdaptiveMode,
    pub order_hint_n_bits: u8,
    pub super_res: bool,
    pub cdef: bool,
    pub restoration: bool,
    pub ss_hor: u8,
    pub ss_ver: u8,
    pub separate_uv_delta_q: bool,
    pub film_grain_present: bool,
    /// Per-operating-point buffer delays. Excluded from the comparison
    /// that decides whether a repeated sequence header starts a new video
    /// sequence; a change here only raises an event.
    pub operating_parameter_info: ArrayVec<OperatingParameterInfo, MAX_OPERATING_POINTS>,
}

impl SequenceHeader {
    /// Whether `other` describes the same video sequence, i.e. everything
    /// except the operating parameter info matches.
    pub(crate) fn same_video_sequence(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.operating_parameter_info.clear();
        b.operating_parameter_info.clear();
        a == b
    }
}

pub(crate) fn parse_seq_hdr(b: &mut Bits<'_>, strict: bool) -> Result<SequenceHeader> {
    let mut hdr = SequenceHeader::default();

    hdr.profile = b.bits(3)? as u8;
    if hdr.profile > 2 {
        return Err(Error::InvalidData("seq_profile"));
    }
    hdr.still_picture = b.bit()?;
    hdr.reduced_still_picture_header = b.bit()?;
    if hdr.reduced_still_picture_header && !hdr.still_picture {
        return Err(Error::InvalidData("reduced_still_picture_header"));
    }

    if hdr.reduced_still_picture_header {
        let mut op = OperatingPoint::default();
        op.major_level = 2 + b.bits(3)? as u8;
        op.minor_level = b.bits(2)? as u8;
        op.initial_display_delay = 10;
        hdr.operating_points.push(op);
        hdr.operating_parameter_info.push(OperatingParameterInfo::default());
    } else {
        hdr.timing_info_present = b.bit()?;
        if hdr.timing_info_present {
            hdr.num_units_in_tick = b.bits(32)?;
            hdr.time_scale = b.bits(32)?;
            if strict && (hdr.num_units_in_tick == 0 || hdr.time_scale == 0) {
                return Err(Error::InvalidData("timing info"));
            }
            hdr.equal_picture_interval = b.bit()?;
            if hdr.equal_picture_interval {
                hdr.num_ticks_per_picture = b.vlc()?.checked_add(1).ok_or(Error::InvalidData("num_ticks_per_picture"))?;
            }
            hdr.decoder_model_info_present = b.bit()?;
            if hdr.decoder_model_info_present {
                hdr.encoder_decoder_buffer_delay_length = b.bits(5)? as u8 + 1;
                hdr.num_units_in_decoding_tick = b.bits(32)?;
                if strict && hdr.num_units_in_decoding_tick == 0 {
                    return Err(Error::InvalidData("num_units_in_decoding_tick"));
                }
                hdr.buffer_removal_delay_length = b.bits(5)? as u8 + 1;
                hdr.frame_presentation_delay_length = b.bits(5)? as u8 + 1;
            }
        }
        hdr.display_model_info_present = b.bit()?;
        let num_operating_points = b.bits(5)? as usize + 1;
        for _ in 0..num_operating_points {
            let mut op = OperatingPoint::default();
            let mut opi = OperatingParameterInfo::default();
            op.idc = b.bits(12)? as u16;
            // a layer mask is either empty or names at least one temporal
            // and one spatial layer
            if op.idc != 0 && (op.idc & 0xff == 0 || op.idc & 0xf00 == 0) {
                return Err(Error::InvalidData("operating_point_idc"));
            }
            op.major_level = 2 + b.bits(3)? as u8;
            op.minor_level = b.bits(2)? as u8;
            if op.major_level > 3 {
                op.tier = b.bits(1)? as u8;
            }
            if hdr.decoder_model_info_present {
                op.decoder_model_param_present = b.bit()?;
                if op.decoder_model_param_present {
                    let n = hdr.encoder_decoder_buffer_delay_length;
                    opi.decoder_buffer_delay = b.bits(n)?;
                    opi.encoder_buffer_delay = b.bits(n)?;
                    opi.low_delay_mode = b.bit()?;
                }
            }
            if hdr.display_model_info_present {
                op.display_model_param_present = b.bit()?;
            }
            op.initial_display_delay = if op.display_model_param_present {
                b.bits(4)? as u8 + 1
            } else {
                10
            };
            hdr.operating_points.push(op);
            hdr.operating_parameter_info.push(opi);
        }
    }

    hdr.width_n_bits = b.bits(4)? as u8 + 1;
    hdr.height_n_bits = b.bits(4)? as u8 + 1;
    hdr.max_width = b.bits(hdr.width_n_bits)? + 1;
    hdr.max_height = b.bits(hdr.height_n_bits)? + 1;
    if !hdr.reduced_still_picture_header {
        hdr.frame_id_numbers_present = b.bit()?;
        if hdr.frame_id_numbers_present {
            hdr.delta_frame_id_n_bits = b.bits(4)? as u8 + 2;
            hdr.frame_id_n_bits = b.bits(3)? as u8 + hdr.delta_frame_id_n_bits + 1;
        }
    }
    hdr.sb128 = b.bit()?;
    hdr.filter_intra = b.bit()?;
    hdr.intra_edge_filter = b.bit()?;
    if hdr.reduced_still_picture_header {
        hdr.screen_content_tools = AdaptiveMode::Adaptive;
        hdr.force_integer_mv = AdaptiveMode::Adaptive;
    } else {
        hdr.inter_intra = b.bit()?;
        hdr.masked_compound = b.bit()?;
        hdr.warped_motion = b.bit()?;
        hdr.dual_filter = b.bit()?;
        hdr.order_hint = b.bit()?;
        if hdr.order_hint {
            hdr.jnt_comp = b.bit()?;
            hdr.ref_frame_mvs = b.bit()?;
        }
        hdr.screen_content_tools = if b.bit()? {
            AdaptiveMode::Adaptive
        } else if b.bit()? {
            AdaptiveMode::On
        } else {
            AdaptiveMode::Off
        };
        hdr.force_integer_mv = if hdr.screen_content_tools != AdaptiveMode::Off {
            if b.bit()? {
                AdaptiveMode::Adaptive
            } else if b.bit()? {
                AdaptiveMode::On
            } else {
                AdaptiveMode::Off
            }
        } else {
            // reserved as "absent"; never consulted when screen content
            // tools are off
            AdaptiveMode::Adaptive
        };
        if hdr.order_hint {
            hdr.order_hint_n_bits = b.bits(3)? as u8 + 1;
        }
    }
    hdr.super_res = b.bit()?;
    hdr.cdef = b.bit()?;
    hdr.restoration = b.bit()?;

    color_config(b, &mut hdr, strict)?;

    hdr.film_grain_present = b.bit()?;

    // The trailing bits are validated by the demultiplexer, which knows
    // whether this OBU carries anything after them.
    Ok(hdr)
}

fn color_config(b: &mut Bits<'_>, hdr: &mut SequenceHeader, strict: bool) -> Result<()> {
    let high_bitdepth = b.bit()?;
    hdr.bit_depth = if hdr.profile == 2 && high_bitdepth {
        if b.bit()? {
            12
        } else {
            10
        }
    } else if high_bitdepth {
        10
    } else {
        8
    };
    if hdr.profile != 1 {
        hdr.monochrome = b.bit()?;
    }
    hdr.color_description_present = b.bit()?;
    if hdr.color_description_present {
        hdr.pri = b.bits(8)? as u8;
        hdr.trc = b.bits(8)? as u8;
        hdr.mtrx = b.bits(8)? as u8;
    } else {
        hdr.pri = COLOR_PRI_UNKNOWN;
        hdr.trc = TRC_UNKNOWN;
        hdr.mtrx = MC_UNKNOWN;
    }

    if hdr.monochrome {
        hdr.color_range = b.bit()?;
        hdr.layout = PixelLayout::I400;
        hdr.ss_hor = 1;
        hdr.ss_ver = 1;
    } else if hdr.pri == COLOR_PRI_BT709 && hdr.trc == TRC_SRGB && hdr.mtrx == MC_IDENTITY {
        hdr.layout = PixelLayout::I444;
        hdr.color_range = true;
        if hdr.profile != 1 && !(hdr.profile == 2 && hdr.bit_depth == 12) {
            return Err(Error::InvalidData("srgb layout"));
        }
    } else {
        hdr.color_range = b.bit()?;
        match hdr.profile {
            0 => {
                hdr.ss_hor = 1;
                hdr.ss_ver = 1;
                hdr.layout = PixelLayout::I420;
            }
            1 => hdr.layout = PixelLayout::I444,
            _ => {
                if hdr.bit_depth == 12 {
                    hdr.ss_hor = b.bits(1)? as u8;
                    if hdr.ss_hor == 1 {
                        hdr.ss_ver = b.bits(1)? as u8;
                    }
                } else {
                    hdr.ss_hor = 1;
                }
                hdr.layout = match (hdr.ss_hor, hdr.ss_ver) {
                    (1, 1) => PixelLayout::I420,
                    (1, 0) => PixelLayout::I422,
                    _ => PixelLayout::I444,
                };
            }
        }
        if hdr.ss_hor == 1 && hdr.ss_ver == 1 {
            hdr.chr = match b.bits(2)? {
                1 => ChromaSamplePosition::Vertical,
                2 => ChromaSamplePosition::Colocated,
                _ => ChromaSamplePosition::Unknown,
            };
        }
    }
    if strict && hdr.mtrx == MC_IDENTITY && hdr.layout != PixelLayout::I444 {
        return Err(Error::InvalidData("identity matrix needs 4:4:4"));
    }
    if !hdr.monochrome {
        hdr.separate_uv_delta_q = b.bit()?;
    }
    Ok(())
}
