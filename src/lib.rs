//! OBU demultiplexer and high-level syntax parser for AV1 elementary
//! streams.
//!
//! Feed raw OBU bytes into a [`Decoder`] with [`Decoder::parse_obus`];
//! the crate recognizes each OBU, decodes sequence and frame headers
//! bit-exactly, maintains the eight-slot reference frame table, and hands
//! completed frames (headers plus tile payloads) to the pixel pipeline
//! behind the [`FrameSink`] trait. HDR metadata and ITU-T T.35 payloads
//! ride along on the pictures they annotate. Pixel decoding itself is out
//! of scope.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[macro_use]
extern crate log;

mod bits;
mod framehdr;
mod handoff;
mod metadata;
mod obu;
mod refs;
mod seqhdr;

#[cfg(test)]
mod testutil;

pub use crate::framehdr::{
    CdefParams, DeltaLfParams, DeltaParams, DeltaQParams, FilmGrainData, FilmGrainHeader,
    FilterMode, FrameHeader, FrameType, LoopFilterParams, ModeRefDeltas, QuantParams,
    RestorationParams, RestorationType, SegmentationData, SegmentationDataSet,
    SegmentationParams, SuperResInfo, TileInfo, TxfmMode, WarpMotionType, WarpedMotionParams,
    NUM_REF_FRAMES, PRIMARY_REF_NONE, REFS_PER_FRAME,
};
pub use crate::handoff::WorkerHandle;
pub use crate::metadata::{ContentLightLevel, ItutT35, MasteringDisplay};
pub use crate::obu::{parse_sequence_header, ObuType, TileGroup};
pub use crate::refs::{CdfContext, MvBuffer, Picture, PictureData, SegmentMap};
pub use crate::seqhdr::{
    AdaptiveMode, ChromaSamplePosition, OperatingParameterInfo, OperatingPoint, PixelLayout,
    SequenceHeader, MAX_OPERATING_POINTS,
};

use crate::handoff::FrameHandoff;
use crate::refs::RefSlots;
use std::sync::Arc;

pub type TryVec<T> = fallible_collections::TryVec<T>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes parser failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Parse error caused by limited parser support rather than invalid data.
    Unsupported(&'static str),
    /// A read ran past the end of the input or of the current OBU.
    UnexpectedEOF,
    /// `parse_sequence_header` scanned the whole input without finding a
    /// sequence header OBU.
    NoSequenceHeader,
    /// Frame dimensions exceed the configured `frame_size_limit`.
    SizeLimit,
    /// Out of memory.
    OutOfMemory,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    fn from(err: bitreader::BitReaderError) -> Error {
        match err {
            bitreader::BitReaderError::NotEnoughData { .. } => Error::UnexpectedEOF,
            bitreader::BitReaderError::TooManyBitsForType { .. } => {
                Error::InvalidData("bit count")
            }
        }
    }
}

impl From<fallible_collections::TryReserveError> for Error {
    fn from(_: fallible_collections::TryReserveError) -> Error {
        Error::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Properties the caller attaches to an input buffer; stamped on the
/// pictures that come out of it and kept next to errors for correlation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataProps {
    pub timestamp: i64,
    pub duration: i64,
    pub offset: i64,
    pub size: usize,
}

/// Stream events, reported on the pictures that introduce them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PictureFlags(u8);

impl PictureFlags {
    /// A sequence header structurally different from the previous one.
    pub const NEW_SEQUENCE: Self = Self(1 << 0);
    /// Operating parameter info changed within the same sequence.
    pub const NEW_OP_PARAMS_INFO: Self = Self(1 << 1);
    /// A temporal delimiter OBU started a new temporal unit.
    pub const NEW_TEMPORAL_UNIT: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for PictureFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PictureFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Which frames are worth decoding; everything else is parsed and then
/// dropped, with reference slots kept consistent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DecodeFrameType {
    #[default]
    All,
    /// Only frames that refresh at least one reference slot.
    Reference,
    /// Only intra-coded frames.
    Intra,
    /// Only key frames.
    Key,
}

#[derive(Clone, Debug)]
pub struct Settings {
    /// Index of the operating point to decode (0..=31).
    pub operating_point: u8,
    /// Publish frames of every spatial layer instead of only the
    /// selected operating point's highest one.
    pub all_layers: bool,
    /// Reject streams that are merely non-conforming rather than
    /// unparseable.
    pub strict_std_compliance: bool,
    /// Upper bound on width × height; 0 means unlimited.
    pub frame_size_limit: u32,
    pub decode_frame_type: DecodeFrameType,
    /// Publish frames with `show_frame == 0` too.
    pub output_invisible_frames: bool,
    /// Ring size of the frame handoff; 1 keeps submission synchronous.
    pub frame_delay: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            operating_point: 0,
            all_layers: true,
            strict_std_compliance: false,
            frame_size_limit: 0,
            decode_frame_type: DecodeFrameType::All,
            output_invisible_frames: false,
            frame_delay: 1,
        }
    }
}

/// A fully-parsed frame on its way to the pixel pipeline.
pub struct SubmittedFrame {
    pub seq_hdr: Arc<SequenceHeader>,
    pub frame_hdr: Arc<FrameHeader>,
    /// Tile groups in bitstream order; together they cover every tile of
    /// the frame exactly once.
    pub tiles: TryVec<TileGroup>,
    /// Present when the handoff runs a worker ring; the pipeline reports
    /// completion or failure through it. Dropping it counts as success.
    pub worker: Option<WorkerHandle>,
}

/// The downstream pixel decoder. `submit_frame` is invoked once per
/// fully-parsed frame and takes ownership of its headers and tile data.
pub trait FrameSink {
    fn submit_frame(&mut self, frame: SubmittedFrame) -> Result<()>;
}

/// Discards submitted frames; stands in when no pixel pipeline is
/// attached.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn submit_frame(&mut self, _frame: SubmittedFrame) -> Result<()> {
        Ok(())
    }
}

/// The stateful stream parser: current headers, reference slots, pending
/// metadata and the frame handoff. One per elementary stream; not
/// re-entrant within itself.
pub struct Decoder<S: FrameSink = NullSink> {
    pub(crate) seq_hdr: Option<Arc<SequenceHeader>>,
    pub(crate) frame_hdr: Option<FrameHeader>,
    pub(crate) tiles: TryVec<TileGroup>,
    pub(crate) n_tiles: u32,
    pub(crate) refs: RefSlots,
    pub(crate) content_light: Option<Arc<ContentLightLevel>>,
    pub(crate) mastering_display: Option<Arc<MasteringDisplay>>,
    pub(crate) itut_t35: TryVec<ItutT35>,
    pub(crate) frame_flags: PictureFlags,
    pub(crate) operating_point: u8,
    pub(crate) operating_point_idc: u32,
    pub(crate) max_spatial_id: u8,
    pub(crate) all_layers: bool,
    pub(crate) strict: bool,
    pub(crate) frame_size_limit: u32,
    pub(crate) decode_frame_type: DecodeFrameType,
    pub(crate) handoff: FrameHandoff,
    pub(crate) cached_error_props: DataProps,
    pub(crate) sink: S,
}

impl Decoder<NullSink> {
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_sink(settings, NullSink)
    }
}

impl<S: FrameSink> Decoder<S> {
    pub fn with_sink(settings: Settings, sink: S) -> Result<Self> {
        if settings.frame_size_limit != 0 {
            debug!(
                "frame size limit set to {} pixels",
                settings.frame_size_limit
            );
        }
        Ok(Self {
            seq_hdr: None,
            frame_hdr: None,
            tiles: TryVec::new(),
            n_tiles: 0,
            refs: RefSlots::default(),
            content_light: None,
            mastering_display: None,
            itut_t35: TryVec::new(),
            frame_flags: PictureFlags::default(),
            operating_point: settings.operating_point.min(31),
            operating_point_idc: 0,
            max_spatial_id: 0,
            all_layers: settings.all_layers,
            strict: settings.strict_std_compliance,
            frame_size_limit: settings.frame_size_limit,
            decode_frame_type: settings.decode_frame_type,
            handoff: FrameHandoff::new(
                settings.frame_delay.max(1),
                settings.output_invisible_frames,
            )?,
            cached_error_props: DataProps::default(),
            sink,
        })
    }

    /// The sequence header governing the frames currently being parsed.
    pub fn sequence_header(&self) -> Option<&Arc<SequenceHeader>> {
        self.seq_hdr.as_ref()
    }

    /// Next published picture, in submission order. A worker error from an
    /// earlier frame is returned (once) only after every output that
    /// precedes it.
    pub fn next_picture(&mut self) -> Result<Option<Picture>> {
        loop {
            if let Some(tp) = self.handoff.take_output() {
                return Ok(Some(tp.p));
            }
            if let Some((err, props)) = self.handoff.take_cached_error() {
                self.cached_error_props = props;
                return Err(err);
            }
            if !self.handoff.has_delayed() {
                return Ok(None);
            }
            self.handoff.drain_one();
        }
    }

    /// Stream events raised since the last call.
    pub fn events(&mut self) -> PictureFlags {
        self.handoff.take_events()
    }

    /// Properties of the input that caused the most recent error.
    pub fn error_data_props(&self) -> DataProps {
        self.cached_error_props
    }

    /// Highest spatial layer of the selected operating point.
    pub fn max_spatial_id(&self) -> u8 {
        self.max_spatial_id
    }

    /// Drops all stream state except the installed sequence header. Any
    /// outstanding worker handles must be completed first.
    pub fn flush(&mut self) {
        self.frame_hdr = None;
        self.tiles.clear();
        self.n_tiles = 0;
        self.refs.drop_all();
        self.content_light = None;
        self.mastering_display = None;
        self.itut_t35.clear();
        self.frame_flags = PictureFlags::default();
        self.handoff.reset();
        self.cached_error_props = DataProps::default();
    }
}
