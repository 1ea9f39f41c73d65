//! Metadata OBU parsing: HDR static metadata and ITU-T T.35 payloads.

use crate::bits::Bits;
use crate::{Result, TryVec};

// metadata_type values from AV1 § 6.7.1
const META_HDR_CLL: u32 = 1;
const META_HDR_MDCV: u32 = 2;
const META_SCALABILITY: u32 = 3;
const META_ITUT_T35: u32 = 4;
const META_TIMECODE: u32 = 5;

/// HDR content light level (max CLL / max FALL), in cd/m².
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContentLightLevel {
    pub max_content_light_level: u16,
    pub max_frame_average_light_level: u16,
}

/// HDR mastering display color volume.
///
/// Primaries and white point are 0.16 fixed point; luminance bounds are
/// 24.8 and 18.14 fixed point respectively, as signaled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MasteringDisplay {
    pub primaries: [[u16; 2]; 3],
    pub white_point: [u16; 2],
    pub max_luminance: u32,
    pub min_luminance: u32,
}

/// One ITU-T T.35 user-data payload, copied verbatim.
#[derive(Debug, Default, PartialEq)]
pub struct ItutT35 {
    pub country_code: u8,
    pub country_code_extension_byte: u8,
    pub payload: TryVec<u8>,
}

pub(crate) enum ParsedMetadata {
    ContentLight(ContentLightLevel),
    MasteringDisplay(MasteringDisplay),
    ItutT35(ItutT35),
    /// Recognized-and-ignored or unknown; the OBU is consumed either way.
    Ignored,
}

/// Parses one `OBU_METADATA` payload (everything after the OBU header).
pub(crate) fn parse_metadata(obu: &[u8]) -> Result<ParsedMetadata> {
    let mut b = Bits::new(obu);
    let meta_type = b.uleb128()?;
    let meta_type_len = b.byte_pos();

    match meta_type {
        META_HDR_CLL => {
            let cll = ContentLightLevel {
                max_content_light_level: b.bits(16)? as u16,
                max_frame_average_light_level: b.bits(16)? as u16,
            };
            b.trailing_bits(true)?;
            Ok(ParsedMetadata::ContentLight(cll))
        }
        META_HDR_MDCV => {
            let mut md = MasteringDisplay::default();
            for plane in &mut md.primaries {
                plane[0] = b.bits(16)? as u16;
                plane[1] = b.bits(16)? as u16;
            }
            md.white_point[0] = b.bits(16)? as u16;
            md.white_point[1] = b.bits(16)? as u16;
            md.max_luminance = b.bits(32)?;
            md.min_luminance = b.bits(32)?;
            b.trailing_bits(true)?;
            Ok(ParsedMetadata::MasteringDisplay(md))
        }
        META_ITUT_T35 => parse_itut_t35(obu, &mut b, meta_type_len),
        META_SCALABILITY | META_TIMECODE => Ok(ParsedMetadata::Ignored),
        6..=31 => Ok(ParsedMetadata::Ignored), // unregistered user private
        _ => {
            warn!("unknown metadata type {meta_type}");
            Ok(ParsedMetadata::Ignored)
        }
    }
}

fn parse_itut_t35(obu: &[u8], b: &mut Bits<'_>, meta_type_len: usize) -> Result<ParsedMetadata> {
    // The payload length is implicit: strip the alignment zeros and the
    // trailing-one byte off the end of the OBU, then subtract the fields
    // in front of the payload.
    let mut end = obu.len();
    while end > 0 && obu[end - 1] == 0 {
        end -= 1;
    }
    if end == 0 || obu[end - 1] != 0x80 {
        warn!("malformed ITU-T T.35 metadata");
        return Ok(ParsedMetadata::Ignored);
    }
    let mut payload_size = end as isize - 1 - meta_type_len as isize;

    let country_code = b.bits(8)? as u8;
    payload_size -= 1;
    let country_code_extension_byte = if country_code == 0xff {
        payload_size -= 1;
        b.bits(8)? as u8
    } else {
        0
    };
    if payload_size <= 0 {
        warn!("malformed ITU-T T.35 metadata");
        return Ok(ParsedMetadata::Ignored);
    }

    let mut payload = TryVec::with_capacity(payload_size as usize)?;
    for _ in 0..payload_size {
        payload.push(b.bits(8)? as u8)?;
    }
    Ok(ParsedMetadata::ItutT35(ItutT35 {
        country_code,
        country_code_extension_byte,
        payload,
    }))
}
