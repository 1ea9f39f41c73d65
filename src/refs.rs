//! The eight-slot reference frame table.
//!
//! Slots share their contents with in-flight frames through reference
//! counting; the table itself is only touched from the parsing thread.

use crate::framehdr::{FrameHeader, NUM_REF_FRAMES};
use crate::metadata::{ContentLightLevel, ItutT35, MasteringDisplay};
use crate::seqhdr::SequenceHeader;
use crate::{DataProps, PictureFlags, TryVec};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

/// Progress value a worker stores when a frame failed to decode.
pub(crate) const FRAME_ERROR: u32 = u32::MAX;

/// Stand-in for the pixel buffers owned by the decode pipeline's memory
/// pool. The parser only tracks identity and lifetime; a slot updated on
/// the skip path has no `PictureData` at all.
#[derive(Debug, Default)]
pub struct PictureData;

/// Entropy coder state saved at the end of a frame.
#[derive(Debug, Default)]
pub struct CdfContext;

/// Per-block segmentation ids of a decoded frame.
#[derive(Debug, Default)]
pub struct SegmentMap;

/// Motion vectors of a decoded frame, for motion field projection.
#[derive(Debug, Default)]
pub struct MvBuffer;

/// One output picture: parsed headers plus the metadata that was pending
/// when the frame completed.
#[derive(Clone, Debug)]
pub struct Picture {
    pub seq_hdr: Arc<SequenceHeader>,
    pub frame_hdr: Arc<FrameHeader>,
    /// `None` for frames that were skipped by the decode-frame-type
    /// filter and live on only as reference headers.
    pub data: Option<Arc<PictureData>>,
    pub content_light: Option<Arc<ContentLightLevel>>,
    pub mastering_display: Option<Arc<MasteringDisplay>>,
    pub itut_t35: Arc<TryVec<ItutT35>>,
    pub props: DataProps,
}

#[derive(Clone, Debug)]
pub(crate) struct ThreadPicture {
    pub p: Picture,
    pub visible: bool,
    pub showable: bool,
    pub flags: PictureFlags,
    pub progress: Option<Arc<AtomicU32>>,
}

impl ThreadPicture {
    pub fn errored(&self) -> bool {
        self.progress
            .as_ref()
            .map_or(false, |p| p.load(std::sync::atomic::Ordering::SeqCst) == FRAME_ERROR)
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct RefSlot {
    pub p: Option<ThreadPicture>,
    pub cdf: Option<Arc<CdfContext>>,
    pub segmap: Option<Arc<SegmentMap>>,
    pub refmvs: Option<Arc<MvBuffer>>,
}

impl RefSlot {
    /// A slot takes part in prediction iff it holds a frame header.
    pub fn populated(&self) -> bool {
        self.p.is_some()
    }

    pub fn frame_hdr(&self) -> Option<&FrameHeader> {
        self.p.as_ref().map(|p| &*p.p.frame_hdr)
    }

    fn clear(&mut self) {
        *self = RefSlot::default();
    }
}

#[derive(Debug, Default)]
pub(crate) struct RefSlots {
    pub slots: [RefSlot; NUM_REF_FRAMES],
}

impl RefSlots {
    /// Read-only header view for the frame-header parser.
    pub fn frame_hdrs(&self) -> [Option<&FrameHeader>; NUM_REF_FRAMES] {
        let mut hdrs = [None; NUM_REF_FRAMES];
        for (h, slot) in hdrs.iter_mut().zip(&self.slots) {
            *h = slot.frame_hdr();
        }
        hdrs
    }

    /// A key frame shown through `show_existing_frame` becomes the sole
    /// ancestor of everything that follows: its picture, CDFs and segmap
    /// replace every other slot, and stale motion vectors are dropped.
    pub fn fan_out_from_key(&mut self, r: usize) {
        if let Some(p) = &mut self.slots[r].p {
            p.showable = false;
        }
        let src = self.slots[r].clone();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if i == r {
                continue;
            }
            slot.p = src.p.clone();
            slot.cdf = src.cdf.clone();
            slot.segmap = src.segmap.clone();
            slot.refmvs = None;
        }
    }

    pub fn drop_all(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picture(offset: u32) -> ThreadPicture {
        ThreadPicture {
            p: Picture {
                seq_hdr: Arc::new(SequenceHeader::default()),
                frame_hdr: Arc::new(FrameHeader {
                    frame_offset: offset,
                    ..Default::default()
                }),
                data: Some(Arc::new(PictureData)),
                content_light: None,
                mastering_display: None,
                itut_t35: Arc::new(TryVec::new()),
                props: DataProps::default(),
            },
            visible: true,
            showable: true,
            flags: PictureFlags::default(),
            progress: None,
        }
    }

    #[test]
    fn fan_out_shares_the_key_slot() {
        let mut refs = RefSlots::default();
        for (i, slot) in refs.slots.iter_mut().enumerate() {
            slot.p = Some(picture(i as u32));
            slot.cdf = Some(Arc::new(CdfContext));
            slot.segmap = Some(Arc::new(SegmentMap));
            slot.refmvs = Some(Arc::new(MvBuffer));
        }
        let key_data = refs.slots[3].p.as_ref().unwrap().p.data.clone().unwrap();
        let key_cdf = refs.slots[3].cdf.clone().unwrap();

        refs.fan_out_from_key(3);
        for (i, slot) in refs.slots.iter().enumerate() {
            let p = slot.p.as_ref().unwrap();
            assert!(Arc::ptr_eq(p.p.data.as_ref().unwrap(), &key_data));
            assert!(Arc::ptr_eq(slot.cdf.as_ref().unwrap(), &key_cdf));
            assert!(!p.showable);
            if i != 3 {
                assert!(slot.refmvs.is_none());
            }
        }
    }

    #[test]
    fn drop_all_empties_every_slot() {
        let mut refs = RefSlots::default();
        refs.slots[5].p = Some(picture(9));
        refs.drop_all();
        assert!(refs.slots.iter().all(|s| !s.populated()));
    }
}
