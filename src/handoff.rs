//! Frame handoff between the single-threaded OBU parser and the frame
//! worker pool behind it.
//!
//! The ring holds one delayed output per worker. Submitting into a slot
//! whose worker still has tile data pending blocks on that slot's
//! condition; this is the only back-pressure channel. Pictures are
//! published in submission order, and a worker error never overtakes the
//! output of an earlier frame.

use crate::refs::ThreadPicture;
use crate::{DataProps, Error, PictureFlags, Result, TryVec};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct SlotState {
    n_tile_data: usize,
    retval: Option<Error>,
    out_delayed: Option<ThreadPicture>,
}

struct Ring {
    // one mutex guards the slot holders and cursors; each slot gets its
    // own "tiles drained" condition
    lock: Mutex<TryVec<SlotState>>,
    conds: TryVec<Condvar>,
    first: AtomicU32,
    cur: AtomicU32,
    reset_task_cur: AtomicU32,
}

/// Completion handle for one submitted frame, held by the decode
/// pipeline. Dropping it counts as successful completion.
pub struct WorkerHandle {
    ring: Arc<Ring>,
    idx: usize,
    progress: Arc<AtomicU32>,
    done: bool,
}

impl WorkerHandle {
    /// Marks the frame's tile data as consumed, unblocking the parser if
    /// it is waiting to reuse this ring slot.
    pub fn finish(self) {}

    /// Reports a decode failure for this frame. The error is surfaced to
    /// the caller once, after every earlier frame's output.
    pub fn fail(mut self, err: Error) {
        self.progress.store(crate::refs::FRAME_ERROR, Ordering::SeqCst);
        let mut slots = self.ring.lock.lock();
        slots[self.idx].retval = Some(err);
        slots[self.idx].n_tile_data = 0;
        self.ring.conds[self.idx].notify_all();
        self.done = true;
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut slots = self.ring.lock.lock();
        slots[self.idx].n_tile_data = 0;
        self.ring.conds[self.idx].notify_all();
    }
}

pub(crate) struct FrameHandoff {
    ring: Arc<Ring>,
    n_fc: usize,
    next: usize,
    occupied: usize,
    output_invisible_frames: bool,
    outputs: VecDeque<ThreadPicture>,
    events: PictureFlags,
    cached_error: Option<(Error, DataProps)>,
}

impl FrameHandoff {
    pub fn new(n_fc: usize, output_invisible_frames: bool) -> Result<Self> {
        debug_assert!(n_fc >= 1);
        let mut slots = TryVec::new();
        let mut conds = TryVec::new();
        for _ in 0..n_fc {
            slots.push(SlotState::default())?;
            conds.push(Condvar::new())?;
        }
        Ok(Self {
            ring: Arc::new(Ring {
                lock: Mutex::new(slots),
                conds,
                first: AtomicU32::new(0),
                cur: AtomicU32::new(0),
                reset_task_cur: AtomicU32::new(u32::MAX),
            }),
            n_fc,
            next: 0,
            occupied: 0,
            output_invisible_frames,
            outputs: VecDeque::new(),
            events: PictureFlags::default(),
            cached_error: None,
        })
    }

    pub fn threaded(&self) -> bool {
        self.n_fc > 1
    }

    /// Hands one completed frame over. With a single worker slot the
    /// picture is published immediately; otherwise it is parked in the
    /// ring and the previous occupant of the slot is harvested first.
    /// Returns the completion handle when the frame has tile data for a
    /// worker to chew on.
    pub fn submit(&mut self, mut pic: ThreadPicture, n_tiles: usize) -> Option<WorkerHandle> {
        if !self.threaded() {
            self.maybe_publish(pic);
            return None;
        }

        let idx = self.next;
        self.next = (self.next + 1) % self.n_fc;

        let ring = Arc::clone(&self.ring);
        let mut slots = ring.lock.lock();
        while slots[idx].n_tile_data > 0 {
            ring.conds[idx].wait(&mut slots);
        }

        if slots[idx].out_delayed.is_some() || slots[idx].retval.is_some() {
            let first = ring.first.load(Ordering::SeqCst);
            if first + 1 < self.n_fc as u32 {
                ring.first.fetch_add(1, Ordering::SeqCst);
            } else {
                ring.first.store(0, Ordering::SeqCst);
            }
            let _ = ring.reset_task_cur.compare_exchange(
                first,
                u32::MAX,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            let cur = ring.cur.load(Ordering::SeqCst);
            if cur != 0 && cur < self.n_fc as u32 {
                ring.cur.store(cur - 1, Ordering::SeqCst);
            }
        } else {
            self.occupied += 1;
        }

        if let Some(err) = slots[idx].retval.take() {
            let props = slots[idx]
                .out_delayed
                .take()
                .map(|p| p.p.props)
                .unwrap_or_default();
            self.cached_error = Some((err, props));
        } else if let Some(old) = slots[idx].out_delayed.take() {
            self.maybe_publish(old);
        }

        let progress = Arc::new(AtomicU32::new(0));
        pic.progress = Some(Arc::clone(&progress));
        slots[idx].out_delayed = Some(pic);
        slots[idx].n_tile_data = n_tiles;
        drop(slots);

        if n_tiles > 0 {
            Some(WorkerHandle {
                ring: Arc::clone(&self.ring),
                idx,
                progress,
                done: false,
            })
        } else {
            None
        }
    }

    /// Harvests the oldest delayed slot, if any. Used once the caller has
    /// no more input.
    pub fn drain_one(&mut self) {
        if self.occupied == 0 {
            return;
        }
        let idx = (self.next + self.n_fc - self.occupied) % self.n_fc;
        let ring = Arc::clone(&self.ring);
        let mut slots = ring.lock.lock();
        while slots[idx].n_tile_data > 0 {
            ring.conds[idx].wait(&mut slots);
        }
        self.occupied -= 1;
        if let Some(err) = slots[idx].retval.take() {
            let props = slots[idx]
                .out_delayed
                .take()
                .map(|p| p.p.props)
                .unwrap_or_default();
            self.cached_error = Some((err, props));
        } else if let Some(old) = slots[idx].out_delayed.take() {
            drop(slots);
            self.maybe_publish(old);
        }
    }

    pub fn has_delayed(&self) -> bool {
        self.occupied > 0
    }

    fn maybe_publish(&mut self, pic: ThreadPicture) {
        if (pic.visible || self.output_invisible_frames) && !pic.errored() {
            self.publish(pic);
        }
    }

    fn publish(&mut self, pic: ThreadPicture) {
        self.events |= pic.flags;
        self.outputs.push_back(pic);
    }

    pub fn take_output(&mut self) -> Option<ThreadPicture> {
        self.outputs.pop_front()
    }

    pub fn take_events(&mut self) -> PictureFlags {
        std::mem::take(&mut self.events)
    }

    pub fn cache_error(&mut self, err: Error, props: DataProps) {
        self.cached_error = Some((err, props));
    }

    /// The error a worker reported for an earlier frame, surfaced exactly
    /// once.
    pub fn take_cached_error(&mut self) -> Option<(Error, DataProps)> {
        self.cached_error.take()
    }

    /// Drops every delayed output and pending error. Callers must not
    /// reset while worker handles are still outstanding.
    pub fn reset(&mut self) {
        let mut slots = self.ring.lock.lock();
        for slot in slots.iter_mut() {
            *slot = SlotState::default();
        }
        drop(slots);
        self.ring.first.store(0, Ordering::SeqCst);
        self.ring.cur.store(0, Ordering::SeqCst);
        self.ring.reset_task_cur.store(u32::MAX, Ordering::SeqCst);
        self.next = 0;
        self.occupied = 0;
        self.outputs.clear();
        self.events = PictureFlags::default();
        self.cached_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framehdr::FrameHeader;
    use crate::refs::{Picture, PictureData};
    use crate::seqhdr::SequenceHeader;

    fn picture(offset: u32, visible: bool) -> ThreadPicture {
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
                props: DataProps {
                    timestamp: offset as i64,
                    ..Default::default()
                },
            },
            visible,
            showable: true,
            flags: PictureFlags::default(),
            progress: None,
        }
    }

    #[test]
    fn synchronous_mode_publishes_directly() {
        let mut h = FrameHandoff::new(1, false).unwrap();
        assert!(h.submit(picture(1, true), 4).is_none());
        assert_eq!(h.take_output().unwrap().p.frame_hdr.frame_offset, 1);
        assert!(h.take_output().is_none());
    }

    #[test]
    fn invisible_frames_filtered_unless_requested() {
        let mut h = FrameHandoff::new(1, false).unwrap();
        h.submit(picture(1, false), 4);
        assert!(h.take_output().is_none());

        let mut h = FrameHandoff::new(1, true).unwrap();
        h.submit(picture(1, false), 4);
        assert!(h.take_output().is_some());
    }

    #[test]
    fn ring_publishes_in_submission_order() {
        let mut h = FrameHandoff::new(3, false).unwrap();
        let mut handles = std::vec::Vec::new();
        for i in 0..3 {
            if let Some(w) = h.submit(picture(i, true), 1) {
                handles.push(w);
            }
        }
        // finish out of order
        let w2 = handles.pop().unwrap();
        let w1 = handles.pop().unwrap();
        let w0 = handles.pop().unwrap();
        w2.finish();
        w0.finish();
        w1.finish();
        while h.has_delayed() {
            h.drain_one();
        }
        let order: std::vec::Vec<u32> = std::iter::from_fn(|| h.take_output())
            .map(|p| p.p.frame_hdr.frame_offset)
            .collect();
        assert_eq!(order, [0, 1, 2]);
    }

    #[test]
    fn worker_error_does_not_overtake_earlier_output() {
        let mut h = FrameHandoff::new(2, false).unwrap();
        let w0 = h.submit(picture(0, true), 1).unwrap();
        let w1 = h.submit(picture(1, true), 1).unwrap();
        w0.finish();
        w1.fail(Error::InvalidData("tile data"));
        while h.has_delayed() {
            h.drain_one();
        }
        // frame 0 is still published, frame 1 surfaces as a cached error
        assert_eq!(h.take_output().unwrap().p.frame_hdr.frame_offset, 0);
        assert!(h.take_output().is_none());
        let (err, props) = h.take_cached_error().unwrap();
        assert_eq!(err, Error::InvalidData("tile data"));
        assert_eq!(props.timestamp, 1);
        assert!(h.take_cached_error().is_none());
    }

    #[test]
    fn submission_blocks_until_tiles_drained() {
        let mut h = FrameHandoff::new(2, false).unwrap();
        let w0 = h.submit(picture(0, true), 1).unwrap();
        let w1 = h.submit(picture(1, true), 1).unwrap();
        // slot 0 is busy again only until its worker finishes
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(30));
            w0.finish();
            w1.finish();
        });
        let w2 = h.submit(picture(2, true), 1).unwrap();
        w2.finish();
        t.join().unwrap();
        // the wait harvested frame 0
        assert_eq!(h.take_output().unwrap().p.frame_hdr.frame_offset, 0);
    }
}
