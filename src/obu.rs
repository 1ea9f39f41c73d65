//! OBU demultiplexing: framing, layer filtering, and dispatch to the
//! syntax parsers.

use crate::bits::{ulog2, Bits};
use crate::framehdr::{FrameHeaderParser, FrameType, PRIMARY_REF_NONE};
use crate::metadata::{parse_metadata, ParsedMetadata};
use crate::refs::{CdfContext, MvBuffer, Picture, PictureData, RefSlot, SegmentMap, ThreadPicture};
use crate::seqhdr::{parse_seq_hdr, SequenceHeader};
use crate::{
    DataProps, DecodeFrameType, Decoder, Error, FrameSink, PictureFlags, Result, SubmittedFrame,
    TryVec,
};
use std::sync::Arc;

/// OBU framing types from AV1 § 6.2.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObuType {
    SeqHdr,
    FrameHdr,
    RedundantFrameHdr,
    Frame,
    TileGrp,
    Metadata,
    TemporalDelimiter,
    Padding,
    Unknown(u8),
}

impl From<u8> for ObuType {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::SeqHdr,
            2 => Self::TemporalDelimiter,
            3 => Self::FrameHdr,
            4 => Self::TileGrp,
            5 => Self::Metadata,
            6 => Self::Frame,
            7 => Self::RedundantFrameHdr,
            15 => Self::Padding,
            _ => Self::Unknown(v),
        }
    }
}

/// One tile group: the tile range it covers and its raw payload for the
/// entropy pipeline.
#[derive(Debug, Default, PartialEq)]
pub struct TileGroup {
    pub start: u16,
    pub end: u16,
    pub data: TryVec<u8>,
}

fn get_byte(data: &mut &[u8]) -> Result<u8> {
    let (&b, rest) = (*data).split_first().ok_or(Error::UnexpectedEOF)?;
    *data = rest;
    Ok(b)
}

/// Splits one OBU off the front of `data` without bit-level work: header,
/// optional extension byte, optional leb128 size.
fn split_obu<'a>(data: &mut &'a [u8]) -> Result<(ObuType, &'a [u8])> {
    let b = get_byte(data)?;
    if b & 0b1000_0000 != 0 {
        return Err(Error::InvalidData("not obu"));
    }
    let kind = ObuType::from(b >> 3 & 0xf);
    let obu_extension_flag = b & 0b100 != 0;
    let obu_has_size_field = b & 0b010 != 0;

    if obu_extension_flag {
        get_byte(data)?;
    }

    let obu_size = if obu_has_size_field {
        leb128::read::unsigned(data)
            .map_err(|_| Error::InvalidData("leb"))?
            .try_into()
            .map_err(|_| Error::UnexpectedEOF)?
    } else {
        data.len()
    };
    let payload = data.get(..obu_size).ok_or(Error::UnexpectedEOF)?;
    *data = &data[obu_size..];
    Ok((kind, payload))
}

/// Scans `data` for the first sequence header OBU and parses it.
/// Persistent decoder state is neither needed nor touched.
pub fn parse_sequence_header(mut data: &[u8]) -> Result<SequenceHeader> {
    while !data.is_empty() {
        let (kind, payload) = split_obu(&mut data)?;
        if kind == ObuType::SeqHdr {
            return parse_seq_hdr(&mut Bits::new(payload), false);
        }
    }
    Err(Error::NoSequenceHeader)
}

impl<S: FrameSink> Decoder<S> {
    /// Consumes one OBU from the front of `data`, updating the context and
    /// possibly dispatching a completed frame. Returns the number of bytes
    /// consumed so the caller can advance its cursor.
    pub fn parse_obus(&mut self, data: &[u8], props: DataProps) -> Result<usize> {
        if let Some((err, err_props)) = self.handoff.take_cached_error() {
            self.cached_error_props = err_props;
            return Err(err);
        }
        match self.parse_obu(data, props) {
            Ok(consumed) => Ok(consumed),
            Err(err) => {
                self.frame_hdr = None;
                self.cached_error_props = props;
                error!("error parsing OBU data: {err}");
                Err(err)
            }
        }
    }

    fn parse_obu(&mut self, data: &[u8], props: DataProps) -> Result<usize> {
        let mut b = Bits::new(data);

        let forbidden = b.bit()?;
        if forbidden && self.strict {
            return Err(Error::InvalidData("obu forbidden bit"));
        }
        let kind = ObuType::from(b.bits(4)? as u8);
        let has_extension = b.bit()?;
        let has_length_field = b.bit()?;
        b.bit()?; // reserved

        let mut temporal_id = 0;
        let mut spatial_id = 0;
        if has_extension {
            temporal_id = b.bits(3)? as u8;
            spatial_id = b.bits(2)? as u8;
            b.bits(3)?; // reserved
        }

        let len = if has_length_field {
            b.uleb128()? as usize
        } else {
            data.len() - b.byte_pos()
        };
        let start = b.byte_pos();
        if len > data.len() - start {
            return Err(Error::InvalidData("obu length"));
        }
        let payload = &data[start..start + len];
        let consumed = start + len;

        // drop OBUs outside the selected operating point's layers
        if kind != ObuType::SeqHdr
            && kind != ObuType::TemporalDelimiter
            && has_extension
            && self.operating_point_idc != 0
        {
            let in_temporal_layer = self.operating_point_idc >> temporal_id & 1 != 0;
            let in_spatial_layer = self.operating_point_idc >> (spatial_id + 8) & 1 != 0;
            if !in_temporal_layer || !in_spatial_layer {
                debug!("OBU in unselected layer (t{temporal_id} s{spatial_id}), skipped");
                return Ok(consumed);
            }
        }

        match kind {
            ObuType::SeqHdr => self.parse_seq_hdr_obu(payload)?,
            ObuType::RedundantFrameHdr if self.frame_hdr.is_some() => {}
            ObuType::FrameHdr | ObuType::RedundantFrameHdr | ObuType::Frame => {
                self.parse_frame_obu(kind, payload, temporal_id, spatial_id)?;
            }
            ObuType::TileGrp => {
                if self.frame_hdr.is_none() {
                    return Err(Error::InvalidData("tile group without frame header"));
                }
                let mut tb = Bits::new(payload);
                self.parse_tile_group(&mut tb, payload)?;
            }
            ObuType::Metadata => match parse_metadata(payload)? {
                ParsedMetadata::ContentLight(cll) => {
                    self.content_light = Some(Arc::new(cll));
                }
                ParsedMetadata::MasteringDisplay(md) => {
                    self.mastering_display = Some(Arc::new(md));
                }
                ParsedMetadata::ItutT35(t35) => self.itut_t35.push(t35)?,
                ParsedMetadata::Ignored => {}
            },
            ObuType::TemporalDelimiter => {
                self.frame_flags |= PictureFlags::NEW_TEMPORAL_UNIT;
            }
            ObuType::Padding => {}
            ObuType::Unknown(v) => {
                warn!("unknown OBU type {v} of size {len}");
            }
        }

        if self.seq_hdr.is_some() && self.frame_hdr.is_some() {
            let show_existing = self.frame_hdr.as_ref().unwrap().show_existing_frame;
            if show_existing {
                self.emit_existing_frame(props)?;
            } else {
                let hdr = self.frame_hdr.as_ref().unwrap();
                let tile_count = u32::from(hdr.tiling.cols) * u32::from(hdr.tiling.rows);
                if self.n_tiles == tile_count {
                    self.complete_frame(props)?;
                }
            }
        }
        Ok(consumed)
    }

    fn parse_seq_hdr_obu(&mut self, payload: &[u8]) -> Result<()> {
        let seq = parse_seq_hdr(&mut Bits::new(payload), self.strict)?;

        let op_idx = if usize::from(self.operating_point) < seq.operating_points.len() {
            usize::from(self.operating_point)
        } else {
            0
        };
        self.operating_point_idc = u32::from(seq.operating_points[op_idx].idc);
        let spatial_mask = self.operating_point_idc >> 8;
        self.max_spatial_id = if spatial_mask != 0 {
            ulog2(spatial_mask) as u8
        } else {
            0
        };

        match &self.seq_hdr {
            None => {
                self.frame_hdr = None;
                self.frame_flags |= PictureFlags::NEW_SEQUENCE;
            }
            Some(cur) if !cur.same_video_sequence(&seq) => {
                // a structurally different sequence header invalidates
                // all inter-frame state
                self.frame_hdr = None;
                self.content_light = None;
                self.mastering_display = None;
                self.refs.drop_all();
                self.frame_flags |= PictureFlags::NEW_SEQUENCE;
            }
            Some(cur) if cur.operating_parameter_info != seq.operating_parameter_info => {
                self.frame_flags |= PictureFlags::NEW_OP_PARAMS_INFO;
            }
            Some(_) => {}
        }
        self.seq_hdr = Some(Arc::new(seq));
        Ok(())
    }

    fn parse_frame_obu(
        &mut self,
        kind: ObuType,
        payload: &[u8],
        temporal_id: u8,
        spatial_id: u8,
    ) -> Result<()> {
        let seq = self
            .seq_hdr
            .clone()
            .ok_or(Error::InvalidData("frame header without sequence header"))?;
        let mut b = Bits::new(payload);
        let hdr = {
            let parser = FrameHeaderParser {
                seq: &seq,
                refs: self.refs.frame_hdrs(),
            };
            parser.parse(&mut b, temporal_id, spatial_id)?
        };
        self.tiles.clear();
        self.n_tiles = 0;
        if kind != ObuType::Frame {
            b.trailing_bits(false)?;
        }
        if self.frame_size_limit != 0
            && u64::from(hdr.width[1]) * u64::from(hdr.height) > u64::from(self.frame_size_limit)
        {
            error!(
                "frame size {}x{} exceeds limit {}",
                hdr.width[1], hdr.height, self.frame_size_limit
            );
            return Err(Error::SizeLimit);
        }
        self.frame_hdr = Some(hdr);

        if kind == ObuType::Frame {
            // a frame OBU carries its first tile group inline, so
            // show_existing_frame cannot be signaled here
            if self.frame_hdr.as_ref().unwrap().show_existing_frame {
                return Err(Error::InvalidData("show_existing_frame in frame OBU"));
            }
            b.bytealign()?;
            self.parse_tile_group(&mut b, payload)?;
        }
        Ok(())
    }

    fn parse_tile_group(&mut self, b: &mut Bits<'_>, payload: &[u8]) -> Result<()> {
        let hdr = self.frame_hdr.as_ref().expect("frame header");
        let tile_count = u32::from(hdr.tiling.cols) * u32::from(hdr.tiling.rows);
        let (start, end) = if tile_count > 1 && b.bit()? {
            let n_bits = hdr.tiling.log2_cols + hdr.tiling.log2_rows;
            (b.bits(n_bits)?, b.bits(n_bits)?)
        } else {
            (0, tile_count - 1)
        };
        b.bytealign()?;
        let data_off = b.byte_pos();

        if start > end || start != self.n_tiles || end >= tile_count {
            self.tiles.clear();
            self.n_tiles = 0;
            return Err(Error::InvalidData("tile group ordering"));
        }
        let mut data = TryVec::new();
        data.extend_from_slice(&payload[data_off..])?;
        self.tiles.push(TileGroup {
            start: start as u16,
            end: end as u16,
            data,
        })?;
        self.n_tiles += end - start + 1;
        Ok(())
    }

    fn filter_allows(&self, frame_type: FrameType, refresh_frame_flags: u8) -> bool {
        let dft = self.decode_frame_type;
        match frame_type {
            FrameType::Inter | FrameType::Switch => {
                !(dft > DecodeFrameType::Reference
                    || (dft == DecodeFrameType::Reference && refresh_frame_flags == 0))
            }
            FrameType::Intra => {
                !(dft > DecodeFrameType::Intra
                    || (dft == DecodeFrameType::Reference && refresh_frame_flags == 0))
            }
            FrameType::Key => true,
        }
    }

    /// `show_existing_frame`: re-emit the referenced slot's picture, then
    /// fan a key frame out over the whole slot table.
    fn emit_existing_frame(&mut self, props: DataProps) -> Result<()> {
        let hdr = self.frame_hdr.take().expect("frame header");
        let idx = usize::from(hdr.existing_frame_idx);

        let (ref_type, refresh, showable) = {
            let tp = self.refs.slots[idx]
                .p
                .as_ref()
                .ok_or(Error::InvalidData("show_existing_frame on empty slot"))?;
            if tp.p.data.is_none() {
                return Err(Error::InvalidData("referenced slot has no picture"));
            }
            (
                tp.p.frame_hdr.frame_type,
                tp.p.frame_hdr.refresh_frame_flags,
                tp.showable,
            )
        };
        if self.strict && !showable {
            return Err(Error::InvalidData("frame shown twice"));
        }

        if self.filter_allows(ref_type, refresh) {
            let mut out = self.refs.slots[idx].p.clone().expect("populated slot");
            out.visible = true;
            out.flags |= std::mem::take(&mut self.frame_flags);
            out.p.content_light = self.content_light.clone();
            out.p.mastering_display = self.mastering_display.clone();
            out.p.itut_t35 = Arc::new(std::mem::take(&mut self.itut_t35));
            out.p.props = props;
            self.handoff.submit(out, 0);
        }

        if ref_type == FrameType::Key {
            self.refs.fan_out_from_key(idx);
        }
        Ok(())
    }

    /// All tile groups are in: either hand the frame to the decode
    /// pipeline or, if the frame-type filter rejects it, keep only its
    /// headers in the refreshed slots.
    fn complete_frame(&mut self, props: DataProps) -> Result<()> {
        let hdr = self.frame_hdr.take().expect("frame header");
        let seq = self.seq_hdr.clone().expect("sequence header");

        if !self.filter_allows(hdr.frame_type, hdr.refresh_frame_flags) {
            let frame_hdr = Arc::new(hdr);
            let header_only = ThreadPicture {
                p: Picture {
                    seq_hdr: seq,
                    frame_hdr: Arc::clone(&frame_hdr),
                    data: None,
                    content_light: None,
                    mastering_display: None,
                    itut_t35: Arc::new(TryVec::new()),
                    props,
                },
                visible: false,
                showable: frame_hdr.showable_frame,
                flags: PictureFlags::default(),
                progress: None,
            };
            for i in 0..8 {
                if frame_hdr.refresh_frame_flags & (1 << i) != 0 {
                    self.refs.slots[i].p = Some(header_only.clone());
                }
            }
            self.tiles.clear();
            self.n_tiles = 0;
            return Ok(());
        }

        if self.tiles.is_empty() {
            return Err(Error::InvalidData("no tile data"));
        }
        let n_tile_data = self.tiles.len();
        let frame_hdr = Arc::new(hdr);
        let pic = ThreadPicture {
            p: Picture {
                seq_hdr: Arc::clone(&seq),
                frame_hdr: Arc::clone(&frame_hdr),
                data: Some(Arc::new(PictureData)),
                content_light: self.content_light.clone(),
                mastering_display: self.mastering_display.clone(),
                itut_t35: Arc::new(std::mem::take(&mut self.itut_t35)),
                props,
            },
            visible: frame_hdr.show_frame
                && (self.all_layers || frame_hdr.spatial_id == self.max_spatial_id),
            showable: frame_hdr.showable_frame,
            flags: std::mem::take(&mut self.frame_flags),
            progress: None,
        };

        let worker = self.handoff.submit(pic.clone(), n_tile_data);

        let tiles = std::mem::take(&mut self.tiles);
        self.n_tiles = 0;
        self.sink.submit_frame(SubmittedFrame {
            seq_hdr: seq,
            frame_hdr: Arc::clone(&frame_hdr),
            tiles,
            worker,
        })?;

        // reference slot refresh: the new picture plus the entropy state,
        // segmentation map and motion vectors this frame's decode produces
        let in_cdf = if frame_hdr.primary_ref_frame != PRIMARY_REF_NONE {
            let pri = usize::from(frame_hdr.refidx[usize::from(frame_hdr.primary_ref_frame)]);
            self.refs.slots[pri].cdf.clone()
        } else {
            None
        };
        let out_cdf = if frame_hdr.refresh_context {
            Arc::new(CdfContext)
        } else {
            in_cdf.unwrap_or_else(|| Arc::new(CdfContext))
        };
        let segmap = if frame_hdr.segmentation.enabled
            && !frame_hdr.segmentation.update_map
            && frame_hdr.primary_ref_frame != PRIMARY_REF_NONE
        {
            let pri = usize::from(frame_hdr.refidx[usize::from(frame_hdr.primary_ref_frame)]);
            self.refs.slots[pri]
                .segmap
                .clone()
                .unwrap_or_else(|| Arc::new(SegmentMap))
        } else {
            Arc::new(SegmentMap)
        };
        let refmvs = Arc::new(MvBuffer);
        for i in 0..8 {
            if frame_hdr.refresh_frame_flags & (1 << i) != 0 {
                self.refs.slots[i] = RefSlot {
                    p: Some(pic.clone()),
                    cdf: Some(Arc::clone(&out_cdf)),
                    segmap: Some(Arc::clone(&segmap)),
                    refmvs: Some(Arc::clone(&refmvs)),
                };
            }
        }
        Ok(())
    }
}
