// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios driving the demultiplexer through full OBU
//! streams composed bit by bit.

use av1_demux::{
    parse_sequence_header, DataProps, DecodeFrameType, Decoder, Error, FrameSink, FrameType,
    PictureFlags, Settings, SubmittedFrame,
};
use std::sync::{Arc, Mutex};

/// MSB-first bit writer; the mirror image of the parser's read order.
struct BitSink {
    bytes: Vec<u8>,
    nbits: u8,
}

impl BitSink {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            nbits: 0,
        }
    }

    fn bit(&mut self, v: bool) {
        self.push(u32::from(v), 1);
    }

    fn push(&mut self, v: u32, n: u8) {
        for i in (0..n).rev() {
            let bit = (v >> i & 1) as u8;
            if self.nbits == 0 {
                self.bytes.push(0);
            }
            let last = self.bytes.last_mut().unwrap();
            *last |= bit << (7 - self.nbits);
            self.nbits = (self.nbits + 1) % 8;
        }
    }

    fn bytealign(&mut self) {
        self.nbits = 0;
    }

    fn trailing(&mut self) {
        self.bit(true);
        self.bytealign();
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

const OBU_SEQ_HDR: u8 = 1;
const OBU_TD: u8 = 2;
const OBU_FRAME_HDR: u8 = 3;
const OBU_TILE_GRP: u8 = 4;
const OBU_METADATA: u8 = 5;
const OBU_FRAME: u8 = 6;

fn obu(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![(kind << 3) | 0b010];
    leb128::write::unsigned(&mut out, payload.len() as u64).unwrap();
    out.extend_from_slice(payload);
    out
}

/// Reduced-still-picture sequence header, profile 0, 320×180, 8-bit
/// 4:2:0, every optional tool off.
fn seq_hdr_reduced() -> Vec<u8> {
    let mut w = BitSink::new();
    w.push(0, 3); // seq_profile
    w.bit(true); // still_picture
    w.bit(true); // reduced_still_picture_header
    w.push(0, 5); // seq_level_idx
    w.push(8, 4); // frame_width_bits - 1
    w.push(7, 4); // frame_height_bits - 1
    w.push(319, 9); // max_frame_width - 1
    w.push(179, 8); // max_frame_height - 1
    w.push(0, 3); // sb128, filter_intra, intra_edge_filter
    w.push(0, 3); // super_res, cdef, restoration
    w.bit(false); // high_bitdepth
    w.bit(false); // monochrome
    w.bit(false); // color_description_present
    w.bit(false); // color_range
    w.push(0, 2); // chroma_sample_position
    w.bit(false); // separate_uv_delta_q
    w.bit(false); // film_grain_present
    w.trailing();
    obu(OBU_SEQ_HDR, &w.finish())
}

/// Plain (non-reduced) sequence header with the same properties and one
/// operating point; order hints stay off.
fn seq_hdr_full() -> Vec<u8> {
    let mut w = BitSink::new();
    w.push(0, 3); // seq_profile
    w.bit(false); // still_picture
    w.bit(false); // reduced_still_picture_header
    w.bit(false); // timing_info_present
    w.bit(false); // initial_display_delay_present
    w.push(0, 5); // operating_points_cnt - 1
    w.push(0, 12); // operating_point_idc
    w.push(0, 3); // seq_level major - 2
    w.push(0, 2); // seq_level minor
    w.push(8, 4); // frame_width_bits - 1
    w.push(7, 4); // frame_height_bits - 1
    w.push(319, 9);
    w.push(179, 8);
    w.bit(false); // frame_id_numbers_present
    w.push(0, 3); // sb128, filter_intra, intra_edge_filter
    w.push(0, 4); // inter_intra, masked_compound, warped_motion, dual_filter
    w.bit(false); // enable_order_hint
    w.bit(false); // seq_choose_screen_content_tools
    w.bit(false); // seq_force_screen_content_tools = off
    w.push(0, 3); // super_res, cdef, restoration
    w.bit(false); // high_bitdepth
    w.bit(false); // monochrome
    w.bit(false); // color_description_present
    w.bit(false); // color_range
    w.push(0, 2); // chroma_sample_position
    w.bit(false); // separate_uv_delta_q
    w.bit(false); // film_grain_present
    w.trailing();
    obu(OBU_SEQ_HDR, &w.finish())
}

/// The tail every frame header in these streams shares once the
/// per-frame-type fields are written: render size from frame size, a
/// single-tile grid, yac=40, no segmentation, default loop filter.
fn frame_hdr_tail(w: &mut BitSink) {
    w.bit(false); // have_render_size
    w.push(0b100, 3); // uniform tiling, 1x1
    w.push(40, 8); // base_q_idx
    w.push(0, 4); // ydc/udc/uac delta presence, qm
    w.bit(false); // segmentation_enabled
    w.bit(false); // delta_q_present
    w.push(0, 6); // loop filter level y[0]
    w.push(0, 6); // loop filter level y[1]
    w.push(0, 3); // sharpness
    w.bit(true); // mode_ref_delta_enabled
    w.bit(false); // mode_ref_delta_update
    w.bit(false); // tx_mode: largest
    w.bit(false); // reduced_tx_set
}

/// Key frame for the reduced-still-picture sequence, as a frame OBU with
/// an inline tile group.
fn key_frame_reduced() -> Vec<u8> {
    let mut w = BitSink::new();
    w.bit(true); // disable_cdf_update
    w.bit(false); // allow_screen_content_tools
    frame_hdr_tail(&mut w);
    w.bytealign();
    w.push(0xde, 8); // tile payload
    w.push(0xad, 8);
    obu(OBU_FRAME, &w.finish())
}

/// Shown key frame for the full sequence header; refreshes all slots.
fn key_frame_shown() -> Vec<u8> {
    let mut w = BitSink::new();
    w.bit(false); // show_existing_frame
    w.push(0, 2); // frame_type: key
    w.bit(true); // show_frame
    w.bit(true); // disable_cdf_update
    w.bit(false); // frame_size_override
    frame_hdr_tail(&mut w);
    w.bytealign();
    w.push(0xaa, 8);
    obu(OBU_FRAME, &w.finish())
}

/// Invisible intra frame refreshing only the requested slots.
fn intra_frame_hidden(refresh: u8) -> Vec<u8> {
    let mut w = BitSink::new();
    w.bit(false); // show_existing_frame
    w.push(2, 2); // frame_type: intra
    w.bit(false); // show_frame
    w.bit(true); // showable_frame
    w.bit(true); // error_resilient_mode
    w.bit(true); // disable_cdf_update
    w.bit(false); // frame_size_override
    w.push(u32::from(refresh), 8); // refresh_frame_flags
    frame_hdr_tail(&mut w);
    w.bytealign();
    w.push(0xbb, 8);
    obu(OBU_FRAME, &w.finish())
}

fn show_existing(idx: u32) -> Vec<u8> {
    let mut w = BitSink::new();
    w.bit(true); // show_existing_frame
    w.push(idx, 3);
    w.trailing();
    obu(OBU_FRAME_HDR, &w.finish())
}

fn feed<S: FrameSink>(dec: &mut Decoder<S>, stream: &[u8]) -> usize {
    let mut pos = 0;
    while pos < stream.len() {
        pos += dec
            .parse_obus(&stream[pos..], DataProps::default())
            .expect("parse_obus failed");
    }
    pos
}

#[test]
fn single_key_frame_reduced_still_picture() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut stream = seq_hdr_reduced();
    stream.extend(key_frame_reduced());

    let mut dec = Decoder::new(Settings::default()).unwrap();
    let consumed = feed(&mut dec, &stream);
    assert_eq!(consumed, stream.len());

    let seq = dec.sequence_header().expect("sequence header installed");
    assert_eq!(seq.operating_points.len(), 1);
    assert_eq!(seq.operating_points[0].initial_display_delay, 10);
    assert_eq!((seq.max_width, seq.max_height), (320, 180));

    let pic = dec.next_picture().unwrap().expect("one frame out");
    assert_eq!(pic.frame_hdr.frame_type, FrameType::Key);
    assert!(pic.frame_hdr.show_frame);
    assert_eq!(pic.frame_hdr.width, [320, 320]);
    assert_eq!(pic.frame_hdr.height, 180);
    assert!(pic.data.is_some());
    assert!(dec.next_picture().unwrap().is_none());
    assert!(dec.events().contains(PictureFlags::NEW_SEQUENCE));
}

#[test]
fn temporal_delimiter_flags_new_unit() {
    let mut stream = seq_hdr_reduced();
    stream.extend(obu(OBU_TD, &[]));
    stream.extend(key_frame_reduced());

    let mut dec = Decoder::new(Settings::default()).unwrap();
    feed(&mut dec, &stream);

    assert!(dec.next_picture().unwrap().is_some());
    let events = dec.events();
    assert!(events.contains(PictureFlags::NEW_TEMPORAL_UNIT));
    assert!(events.contains(PictureFlags::NEW_SEQUENCE));
}

#[test]
fn show_existing_key_frame_fans_out() {
    let mut stream = seq_hdr_full();
    stream.extend(key_frame_shown()); // key in every slot
    stream.extend(intra_frame_hidden(0x20)); // slot 5 becomes intra
    stream.extend(show_existing(3));
    stream.extend(show_existing(5));

    let mut dec = Decoder::new(Settings::default()).unwrap();
    let consumed = feed(&mut dec, &stream);
    assert_eq!(consumed, stream.len());

    let first = dec.next_picture().unwrap().expect("key frame");
    assert_eq!(first.frame_hdr.frame_type, FrameType::Key);
    let second = dec.next_picture().unwrap().expect("slot 3");
    assert_eq!(second.frame_hdr.frame_type, FrameType::Key);
    // showing the key fanned it out over all slots, so slot 5 yields the
    // key frame again, not the intra frame that was parked there
    let third = dec.next_picture().unwrap().expect("slot 5");
    assert_eq!(third.frame_hdr.frame_type, FrameType::Key);
    assert!(dec.next_picture().unwrap().is_none());
}

#[test]
fn show_existing_without_fan_out_sees_the_intra_frame() {
    let mut stream = seq_hdr_full();
    stream.extend(key_frame_shown());
    stream.extend(intra_frame_hidden(0x20));
    stream.extend(show_existing(5));

    let mut dec = Decoder::new(Settings::default()).unwrap();
    feed(&mut dec, &stream);

    let _key = dec.next_picture().unwrap().expect("key frame");
    let fifth = dec.next_picture().unwrap().expect("slot 5");
    assert_eq!(fifth.frame_hdr.frame_type, FrameType::Intra);
}

#[test]
fn repeated_sequence_header_keeps_reference_slots() {
    let mut dec = Decoder::new(Settings::default()).unwrap();

    let mut stream = seq_hdr_full();
    stream.extend(key_frame_shown());
    feed(&mut dec, &stream);
    assert!(dec.next_picture().unwrap().is_some());
    assert!(dec.events().contains(PictureFlags::NEW_SEQUENCE));

    // the same header again: no new-sequence event, slots survive
    let mut stream = seq_hdr_full();
    stream.extend(show_existing(3));
    feed(&mut dec, &stream);
    assert!(dec.next_picture().unwrap().is_some());
    assert!(!dec.events().contains(PictureFlags::NEW_SEQUENCE));
}

#[test]
fn oversized_length_field_rejected_up_front() {
    // leb128 length 0xFFFFFFFF with 10 bytes of input
    let data = [0x1a, 0xff, 0xff, 0xff, 0xff, 0x0f, 0, 0, 0, 0];
    let mut dec = Decoder::new(Settings::default()).unwrap();
    assert!(matches!(
        dec.parse_obus(&data, DataProps::default()),
        Err(Error::InvalidData(_))
    ));
}

#[test]
fn itut_t35_metadata_rides_on_the_next_frame() {
    let mut stream = seq_hdr_reduced();
    stream.extend(obu(
        OBU_METADATA,
        &[0x04, 0xff, 0x01, 0x12, 0x34, 0x56, 0x80, 0x00],
    ));
    stream.extend(key_frame_reduced());

    let mut dec = Decoder::new(Settings::default()).unwrap();
    feed(&mut dec, &stream);

    let pic = dec.next_picture().unwrap().expect("frame out");
    assert_eq!(pic.itut_t35.len(), 1);
    let t35 = &pic.itut_t35[0];
    assert_eq!(t35.country_code, 0xff);
    assert_eq!(t35.country_code_extension_byte, 0x01);
    assert_eq!(t35.payload.as_slice(), &[0x12, 0x34, 0x56]);
}

#[test]
fn hdr_metadata_rides_on_the_next_frame() {
    let mut cll = vec![0x01];
    cll.extend_from_slice(&[0x03, 0xe8, 0x01, 0x2c, 0x80]);
    let mut stream = seq_hdr_reduced();
    stream.extend(obu(OBU_METADATA, &cll));
    stream.extend(key_frame_reduced());

    let mut dec = Decoder::new(Settings::default()).unwrap();
    feed(&mut dec, &stream);
    let pic = dec.next_picture().unwrap().expect("frame out");
    let cll = pic.content_light.expect("content light attached");
    assert_eq!(cll.max_content_light_level, 1000);
    assert_eq!(cll.max_frame_average_light_level, 300);
}

#[derive(Clone, Default)]
struct RecordingSink {
    frames: Arc<Mutex<Vec<Vec<(u16, u16, Vec<u8>)>>>>,
}

impl FrameSink for RecordingSink {
    fn submit_frame(&mut self, frame: SubmittedFrame) -> Result<(), Error> {
        let tiles = frame
            .tiles
            .iter()
            .map(|t| (t.start, t.end, t.data.to_vec()))
            .collect();
        self.frames.lock().unwrap().push(tiles);
        Ok(())
    }
}

/// 2×2 tile grid variant of the reduced key frame, split over a frame
/// header OBU and standalone tile group OBUs.
fn multi_tile_frame_hdr() -> Vec<u8> {
    let mut w = BitSink::new();
    w.bit(true); // disable_cdf_update
    w.bit(false); // allow_screen_content_tools
    w.bit(false); // have_render_size
    w.bit(true); // uniform tiling
    w.push(0b10, 2); // log2_cols = 1
    w.push(0b10, 2); // log2_rows = 1
    w.push(0, 2); // context_update_tile_id
    w.push(0, 2); // tile_size_bytes - 1
    w.push(40, 8); // base_q_idx
    w.push(0, 4);
    w.bit(false); // segmentation_enabled
    w.bit(false); // delta_q_present
    w.push(0, 6);
    w.push(0, 6);
    w.push(0, 3);
    w.bit(true); // mode_ref_delta_enabled
    w.bit(false); // mode_ref_delta_update
    w.bit(false); // tx_mode: largest
    w.bit(false); // reduced_tx_set
    w.trailing();
    obu(OBU_FRAME_HDR, &w.finish())
}

fn tile_group(start: u32, end: u32, byte: u8) -> Vec<u8> {
    let mut w = BitSink::new();
    w.bit(true); // tile_start_and_end_present
    w.push(start, 2);
    w.push(end, 2);
    w.bytealign();
    w.push(u32::from(byte), 8);
    obu(OBU_TILE_GRP, &w.finish())
}

#[test]
fn tile_groups_complete_the_frame() {
    let mut stream = seq_hdr_reduced();
    stream.extend(multi_tile_frame_hdr());
    stream.extend(tile_group(0, 1, 0x11));
    stream.extend(tile_group(2, 3, 0x22));

    let sink = RecordingSink::default();
    let frames = sink.frames.clone();
    let mut dec = Decoder::with_sink(Settings::default(), sink).unwrap();
    feed(&mut dec, &stream);

    let frames = frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].len(), 2);
    assert_eq!((frames[0][0].0, frames[0][0].1), (0, 1));
    assert_eq!((frames[0][1].0, frames[0][1].1), (2, 3));
    assert_eq!(frames[0][0].2, [0x11]);
    assert_eq!(frames[0][1].2, [0x22]);
}

#[test]
fn tile_group_gap_discards_the_frame() {
    let mut stream = seq_hdr_reduced();
    stream.extend(multi_tile_frame_hdr());
    stream.extend(tile_group(0, 0, 0x11));

    let sink = RecordingSink::default();
    let frames = sink.frames.clone();
    let mut dec = Decoder::with_sink(Settings::default(), sink).unwrap();
    feed(&mut dec, &stream);

    // a tile group skipping ahead: rejected, and everything so far dropped
    let bad = tile_group(2, 3, 0x22);
    assert!(matches!(
        dec.parse_obus(&bad, DataProps::default()),
        Err(Error::InvalidData(_))
    ));
    // the in-progress frame is gone; more tile data has nowhere to go
    let tail = tile_group(1, 3, 0x33);
    assert!(dec.parse_obus(&tail, DataProps::default()).is_err());
    assert!(frames.lock().unwrap().is_empty());
    assert!(dec.next_picture().unwrap().is_none());
}

#[test]
fn decode_frame_type_filter_skips_but_keeps_headers() {
    let mut stream = seq_hdr_full();
    stream.extend(key_frame_shown());
    stream.extend(intra_frame_hidden(0x20));

    let mut dec = Decoder::new(Settings {
        decode_frame_type: DecodeFrameType::Key,
        ..Settings::default()
    })
    .unwrap();
    feed(&mut dec, &stream);

    let key = dec.next_picture().unwrap().expect("key frame");
    assert_eq!(key.frame_hdr.frame_type, FrameType::Key);
    assert!(dec.next_picture().unwrap().is_none());

    // the skipped intra frame still refreshed slot 5 with its header, so
    // the slot no longer holds a displayable picture
    assert!(matches!(
        dec.parse_obus(&show_existing(5), DataProps::default()),
        Err(Error::InvalidData(_))
    ));
    // slots the skip did not touch still show fine
    feed(&mut dec, &show_existing(3));
    let pic = dec.next_picture().unwrap().expect("slot 3");
    assert_eq!(pic.frame_hdr.frame_type, FrameType::Key);
}

#[test]
fn worker_error_surfaces_once_in_order() {
    struct FailingSink;
    impl FrameSink for FailingSink {
        fn submit_frame(&mut self, frame: SubmittedFrame) -> Result<(), Error> {
            if let Some(worker) = frame.worker {
                if frame.frame_hdr.frame_type == FrameType::Intra {
                    worker.fail(Error::InvalidData("tile data"));
                }
            }
            Ok(())
        }
    }

    let mut stream = seq_hdr_full();
    stream.extend(key_frame_shown());
    stream.extend(intra_frame_hidden(0x20));

    let mut dec = Decoder::with_sink(
        Settings {
            frame_delay: 2,
            output_invisible_frames: true,
            ..Settings::default()
        },
        FailingSink,
    )
    .unwrap();
    feed(&mut dec, &stream);

    // the key frame's output precedes the intra frame's error
    let key = dec.next_picture().unwrap().expect("key frame");
    assert_eq!(key.frame_hdr.frame_type, FrameType::Key);
    assert!(matches!(
        dec.next_picture(),
        Err(Error::InvalidData("tile data"))
    ));
    assert!(matches!(dec.next_picture(), Ok(None)));
}

#[test]
fn sequence_header_scan() {
    let mut stream = obu(OBU_TD, &[]);
    stream.extend(seq_hdr_reduced());
    stream.extend(key_frame_reduced());
    let seq = parse_sequence_header(&stream).expect("found");
    assert_eq!((seq.max_width, seq.max_height), (320, 180));
    assert!(seq.reduced_still_picture_header);

    let no_seq = obu(OBU_TD, &[]);
    assert_eq!(parse_sequence_header(&no_seq), Err(Error::NoSequenceHeader));
}

#[test]
fn flush_keeps_sequence_header_only() {
    let mut stream = seq_hdr_full();
    stream.extend(key_frame_shown());
    let mut dec = Decoder::new(Settings::default()).unwrap();
    feed(&mut dec, &stream);
    assert!(dec.next_picture().unwrap().is_some());

    dec.flush();
    assert!(dec.sequence_header().is_some());
    assert!(dec.next_picture().unwrap().is_none());
    // reference slots are gone: show_existing now fails
    assert!(dec
        .parse_obus(&show_existing(3), DataProps::default())
        .is_err());
}
