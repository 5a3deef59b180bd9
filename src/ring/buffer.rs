//! SPSC byte ring with producer-side relocation
//!
//! One producer thread reserves contiguous regions, commits bytes into them
//! and publishes the writer cursor; one consumer thread drains published
//! windows. Cursors are monotonic absolute stream offsets; the in-buffer
//! offset of a cursor is `cursor - segment.base`. Wrap-around never happens:
//! when the tail of the current segment cannot hold a reservation, the
//! producer relocates into a fresh segment whose `base` restarts the
//! in-buffer offsets at zero.
//!
//! Relocation is cheap when the ring is drained (nothing to copy) and
//! otherwise copies the unconsumed region `[R, writer)` to the head of the
//! new segment. Retired segments are reclaimed through epoch pins, so a
//! consumer holding a window into the old segment never observes freed
//! memory.
//!
//! Publication uses a release fence followed by a relaxed store, the
//! cheapest protocol that keeps payload stores ordered before the cursor
//! store on every architecture.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{ fence, AtomicU64, Ordering };

use crossbeam::epoch::{ self, Atomic, Guard, Owned };
use crossbeam::utils::CachePadded;

use crate::config::RingTuning;
use crate::error::Result;

/// One contiguous allocation of the ring's byte stream.
///
/// `base` is the absolute stream offset of `data[0]`. Invariant:
/// `base <= R <= W <= producer_writer <= base + len`.
struct Segment {
    base: u64,
    len: usize,
    /// Published writer cursor (absolute)
    w: CachePadded<AtomicU64>,
    /// Published reader cursor (absolute)
    r: CachePadded<AtomicU64>,
    data: *mut u8,
}

impl Segment {
    fn alloc(base: u64, len: usize, w: u64, r: u64) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        Self {
            base,
            len,
            w: CachePadded::new(AtomicU64::new(w)),
            r: CachePadded::new(AtomicU64::new(r)),
            data: Box::into_raw(boxed) as *mut u8,
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe {
                // SAFETY: data/len came from Box::into_raw of a boxed slice
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.data, self.len)));
            }
        }
    }
}

// SAFETY: the raw data pointer is safe to share because the producer writes
// only `[writer, base + len)` and the consumer reads only `[R, W)`, regions
// that never overlap, and cursor publication carries the necessary fences.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

/// Shared ring state: the current segment, swapped only by the producer.
pub struct Ring {
    seg: Atomic<Segment>,
}

impl Drop for Ring {
    fn drop(&mut self) {
        unsafe {
            // SAFETY: by the time the ring drops, both endpoints are gone,
            // so no thread can still hold a window into the segment.
            let guard = epoch::unprotected();
            let seg = self.seg.load(Ordering::Relaxed, guard);
            if !seg.is_null() {
                drop(seg.into_owned());
            }
        }
    }
}

/// Producer-cached view of the current segment.
#[derive(Clone, Copy)]
struct SegView {
    seg: *const Segment,
    base: u64,
    len: usize,
    data: *mut u8,
}

impl SegView {
    fn of(seg: &Segment) -> Self {
        Self { seg: seg as *const Segment, base: seg.base, len: seg.len, data: seg.data }
    }
}

/// The single producing endpoint of a ring.
pub struct RingProducer {
    ring: Arc<Ring>,
    view: SegView,
    /// Private writer cursor, ahead of the published `W`
    writer: u64,
    /// Last published `W`
    published: u64,
    multiplier: f64,
    floor: usize,
}

// SAFETY: the producer is moved to exactly one thread; the raw view pointer
// stays valid because only the producer retires segments.
unsafe impl Send for RingProducer {}

/// The single consuming endpoint of a ring.
pub struct RingConsumer {
    ring: Arc<Ring>,
    /// Private reader cursor
    pos: u64,
    /// Last value stored into the published `R`
    seen_r: u64,
}

unsafe impl Send for RingConsumer {}

/// Create one SPSC ring and split it into its two endpoints.
pub fn ring(tuning: RingTuning) -> (RingProducer, RingConsumer) {
    let ring = Arc::new(Ring {
        seg: Atomic::new(Segment::alloc(0, tuning.initial_size, 0, 0)),
    });
    let view = unsafe {
        // SAFETY: no other thread can observe the ring yet
        let guard = epoch::unprotected();
        SegView::of(ring.seg.load(Ordering::Relaxed, guard).deref())
    };
    let producer = RingProducer {
        ring: Arc::clone(&ring),
        view,
        writer: 0,
        published: 0,
        multiplier: tuning.multiplier,
        floor: tuning.initial_size,
    };
    let consumer = RingConsumer { ring, pos: 0, seen_r: 0 };
    (producer, consumer)
}

impl RingProducer {
    /// Reserve a contiguous writable region of at least `min` bytes.
    ///
    /// The returned slice is the whole remaining tail of the segment, so a
    /// caller may build a record larger than `min` without re-reserving, as
    /// long as it commits no more than it received.
    pub fn reserve(&mut self, min: usize) -> Result<&mut [u8]> {
        if self.writer + (min as u64) > self.view.base + (self.view.len as u64) {
            self.relocate(min)?;
        }
        let off = (self.writer - self.view.base) as usize;
        let avail = self.view.len - off;
        debug_assert!(avail >= min);
        unsafe {
            // SAFETY: [writer, base + len) is producer-exclusive
            Ok(std::slice::from_raw_parts_mut(self.view.data.add(off), avail))
        }
    }

    /// Advance the private writer over `n` bytes written into the last
    /// reservation.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.writer + (n as u64) <= self.view.base + (self.view.len as u64));
        self.writer += n as u64;
    }

    /// Copy `bytes` into the ring in one reserve/commit step.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let dst = self.reserve(bytes.len())?;
        dst[..bytes.len()].copy_from_slice(bytes);
        self.commit(bytes.len());
        Ok(())
    }

    /// Publish everything committed so far. Returns the new `W` when the
    /// store happened, `None` when there was nothing unpublished.
    pub fn publish(&mut self) -> Option<u64> {
        if self.writer == self.published {
            return None;
        }
        // Payload stores stay ordered before the cursor store; the fence is
        // free on TSO and the required release on weaker machines.
        fence(Ordering::Release);
        unsafe {
            // SAFETY: view.seg is the current segment, retired only by us
            (*self.view.seg).w.store(self.writer, Ordering::Relaxed);
        }
        self.published = self.writer;
        Some(self.writer)
    }

    /// The private writer position (absolute).
    pub fn position(&self) -> u64 {
        self.writer
    }

    /// Bytes committed but not yet published.
    pub fn unpublished(&self) -> usize {
        (self.writer - self.published) as usize
    }

    /// Move into a new segment with room for `min` more bytes.
    ///
    /// The published reader cursor may lag the consumer's true progress, in
    /// which case some already-consumed bytes are copied too; that is
    /// harmless because the consumer addresses the stream by absolute
    /// position.
    fn relocate(&mut self, min: usize) -> Result<()> {
        let reader = unsafe { (*self.view.seg).r.load(Ordering::Acquire) };
        debug_assert!(reader <= self.writer);
        let occupancy = (self.writer - reader) as usize;

        let need = occupancy + min;
        let mut new_len = ((need as f64) * self.multiplier) as usize;
        if new_len < self.floor {
            new_len = self.floor;
        }
        if new_len < need {
            new_len = need;
        }

        let new_seg = Segment::alloc(reader, new_len, self.published, reader);
        if occupancy > 0 {
            let src_off = (reader - self.view.base) as usize;
            unsafe {
                // SAFETY: [reader, writer) lies within the old segment and
                // fits the new one by construction
                ptr::copy_nonoverlapping(self.view.data.add(src_off), new_seg.data, occupancy);
            }
        }

        let guard = epoch::pin();
        let new_shared = Owned::new(new_seg).into_shared(&guard);
        let old = self.ring.seg.swap(new_shared, Ordering::Release, &guard);
        unsafe {
            // SAFETY: the old segment is unreachable for new loads; pinned
            // readers keep it alive until their guards drop
            guard.defer_destroy(old);
        }
        self.view = SegView::of(unsafe { new_shared.deref() });
        Ok(())
    }
}

impl RingConsumer {
    /// True when published data is waiting beyond the private reader.
    pub fn has_pending(&self) -> bool {
        let guard = epoch::pin();
        let seg = self.ring.seg.load(Ordering::Acquire, &guard);
        unsafe { seg.deref().w.load(Ordering::Acquire) > self.pos }
    }

    /// The private reader position (absolute).
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Pin the current segment and start a drain pass.
    pub fn begin(&mut self) -> Drain<'_> {
        let guard = epoch::pin();
        let seg = self.ring.seg.load(Ordering::Acquire, &guard).as_raw();
        Drain { consumer: self, _guard: guard, seg }
    }

    /// Store the private reader into the published `R` so the producer can
    /// size its next relocation. Called at flush checkpoints, not per
    /// record.
    pub fn publish_read(&mut self) {
        if self.pos == self.seen_r {
            return;
        }
        let guard = epoch::pin();
        let seg = self.ring.seg.load(Ordering::Acquire, &guard);
        unsafe {
            seg.deref().r.store(self.pos, Ordering::Release);
        }
        self.seen_r = self.pos;
    }
}

/// One pinned drain pass over a ring.
///
/// The pass holds an epoch guard, so the window slice stays valid even if
/// the producer relocates concurrently; data published after the relocation
/// becomes visible on the next pass.
pub struct Drain<'c> {
    consumer: &'c mut RingConsumer,
    _guard: Guard,
    seg: *const Segment,
}

impl Drain<'_> {
    /// The published window `[private_reader, W)`.
    pub fn window(&self) -> &[u8] {
        let seg = unsafe { &*self.seg };
        let w = seg.w.load(Ordering::Acquire);
        let pos = self.consumer.pos;
        if pos >= w {
            return &[];
        }
        debug_assert!(pos >= seg.base && w <= seg.base + (seg.len as u64));
        let start = (pos - seg.base) as usize;
        let end = (w - seg.base) as usize;
        unsafe {
            // SAFETY: [R, W) is consumer-exclusive and within the segment
            std::slice::from_raw_parts(seg.data.add(start), end - start)
        }
    }

    /// Mark `n` bytes of the window consumed.
    pub fn advance(&mut self, n: usize) {
        self.consumer.pos += n as u64;
    }
}
