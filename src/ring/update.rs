//! Producer-side update queue
//!
//! Cursor publications and wakes are batched: each publish event is
//! appended here and flushed at scheduler checkpoints (once per loop turn,
//! or inline when the queue fills). A flush coalesces entries down to one
//! cursor store per link and direction and signals each touched consumer at
//! most once, and only when its sleep word reads ASLEEP.

use crate::error::Result;
use crate::ring::wake::{ SleepState, WakeFd };

/// One pending publish event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateEntry {
    /// Link index (app index on a worker, worker index on an app)
    pub link: u32,
    /// New cursor position being announced
    pub position: u64,
    /// True for a writer-cursor publication, false for a readership advance
    pub is_write: bool,
}

/// A flush target: one link's producer half plus the remote consumer's
/// wake handles.
pub trait UpdateTarget {
    /// Publish the writer cursor; `Some` when a store happened.
    fn publish_write(&mut self) -> Option<u64>;
    /// Publish the reader cursor.
    fn publish_read(&mut self);
    /// The remote consumer's sleep word.
    fn consumer_sleep(&self) -> &SleepState;
    /// The remote consumer's wake descriptor.
    fn consumer_wake(&self) -> &WakeFd;
}

/// Bounded FIFO of pending publish events, owned by one producer thread.
pub struct UpdateQueue {
    entries: Vec<UpdateEntry>,
    capacity: usize,
    // per-link coalescing marks, reused across flushes
    wrote: Vec<bool>,
    read: Vec<bool>,
}

impl UpdateQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            wrote: Vec::new(),
            read: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a publish event, flushing inline when the queue is at
    /// capacity. The producer thus blocks on its own flush work instead of
    /// ever dropping an event.
    pub fn record<T: UpdateTarget>(
        &mut self,
        links: &mut [T],
        entry: UpdateEntry
    ) -> Result<()> {
        if self.entries.len() == self.capacity {
            self.flush(links)?;
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Publish the highest position per touched link and wake consumers
    /// observed ASLEEP.
    pub fn flush<T: UpdateTarget>(&mut self, links: &mut [T]) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        if self.wrote.len() < links.len() {
            self.wrote.resize(links.len(), false);
            self.read.resize(links.len(), false);
        }

        for entry in self.entries.drain(..) {
            let idx = entry.link as usize;
            debug_assert!(idx < links.len());
            if idx < links.len() {
                if entry.is_write {
                    self.wrote[idx] = true;
                } else {
                    self.read[idx] = true;
                }
            }
        }

        for (idx, link) in links.iter_mut().enumerate() {
            if self.read[idx] {
                self.read[idx] = false;
                link.publish_read();
            }
            if self.wrote[idx] {
                self.wrote[idx] = false;
                if link.publish_write().is_some() && link.consumer_sleep().needs_signal() {
                    link.consumer_wake().signal();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FakeLink {
        sleep: Arc<SleepState>,
        wake: WakeFd,
        writer: u64,
        published: u64,
        reads_published: usize,
    }

    impl FakeLink {
        fn new() -> Self {
            Self {
                sleep: Arc::new(SleepState::new()),
                wake: WakeFd::new().unwrap(),
                writer: 0,
                published: 0,
                reads_published: 0,
            }
        }
    }

    impl UpdateTarget for FakeLink {
        fn publish_write(&mut self) -> Option<u64> {
            if self.writer == self.published {
                return None;
            }
            self.published = self.writer;
            Some(self.published)
        }

        fn publish_read(&mut self) {
            self.reads_published += 1;
        }

        fn consumer_sleep(&self) -> &SleepState {
            &self.sleep
        }

        fn consumer_wake(&self) -> &WakeFd {
            &self.wake
        }
    }

    fn entry(link: u32, position: u64, is_write: bool) -> UpdateEntry {
        UpdateEntry { link, position, is_write }
    }

    #[test]
    fn test_flush_coalesces_writes() {
        let mut links = vec![FakeLink::new()];
        links[0].writer = 30;
        links[0].sleep.fall_asleep();

        let mut queue = UpdateQueue::new(8);
        for pos in [10, 20, 30] {
            queue.record(&mut links, entry(0, pos, true)).unwrap();
        }
        queue.flush(&mut links).unwrap();

        assert_eq!(links[0].published, 30);
        // exactly one signal for three entries
        assert!(links[0].wake.wait(Some(std::time::Duration::from_millis(50))).unwrap());
        assert!(!links[0].wake.wait(Some(std::time::Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_no_signal_when_awake() {
        let mut links = vec![FakeLink::new()];
        links[0].writer = 5;

        let mut queue = UpdateQueue::new(8);
        queue.record(&mut links, entry(0, 5, true)).unwrap();
        queue.flush(&mut links).unwrap();

        assert_eq!(links[0].published, 5);
        assert!(!links[0].wake.wait(Some(std::time::Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_read_entries_do_not_wake() {
        let mut links = vec![FakeLink::new()];
        links[0].sleep.fall_asleep();

        let mut queue = UpdateQueue::new(8);
        queue.record(&mut links, entry(0, 7, false)).unwrap();
        queue.flush(&mut links).unwrap();

        assert_eq!(links[0].reads_published, 1);
        assert!(!links[0].wake.wait(Some(std::time::Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_full_queue_flushes_inline() {
        let mut links = vec![FakeLink::new()];
        let mut queue = UpdateQueue::new(2);
        links[0].writer = 3;

        queue.record(&mut links, entry(0, 1, true)).unwrap();
        queue.record(&mut links, entry(0, 2, true)).unwrap();
        // third record hits capacity and flushes the first two
        queue.record(&mut links, entry(0, 3, true)).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(links[0].published, 3);
    }
}
