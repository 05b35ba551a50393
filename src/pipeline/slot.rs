//! Latest-wins single-slot hand-off for the in-process tier

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::capture::Frame;

/// Capacity-1 slot that remembers the last delivered frame.
///
/// `put` replaces an unread frame instead of waiting, `get` keeps returning
/// the newest frame once it has been consumed. Both are a single atomic
/// swap/load of the current entry, so readers never see frames go backwards.
pub struct LatestFrameSlot {
    current: ArcSwapOption<Entry>,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct Entry {
    frame: Arc<Frame>,
    taken: AtomicBool,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_coalesced: AtomicUsize,
}

/// Snapshot of slot counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotStats {
    pub written: usize,
    pub read: usize,
    pub coalesced: usize,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: store `frame`, discarding an unread one. Never blocks.
    pub fn put(&self, frame: Frame) {
        let entry = Arc::new(Entry {
            frame: Arc::new(frame),
            taken: AtomicBool::new(false),
        });

        let evicted = self.current.swap(Some(entry));
        if evicted.is_some_and(|old| !old.taken.load(Ordering::Acquire)) {
            self.stats.frames_coalesced.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("framegrab_frames_coalesced_total").increment(1);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumer: the newest frame, consumed or not. `None` only before the first `put`.
    pub fn get(&self) -> Option<Arc<Frame>> {
        let entry = self.current.load_full()?;
        if !entry.taken.swap(true, Ordering::AcqRel) {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        }
        Some(Arc::clone(&entry.frame))
    }

    /// Whether an unread frame is waiting
    pub fn has_unread(&self) -> bool {
        match &*self.current.load() {
            Some(entry) => !entry.taken.load(Ordering::Acquire),
            None => false,
        }
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            coalesced: self.stats.frames_coalesced.load(Ordering::Relaxed),
        }
    }
}

impl Default for LatestFrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameShape;
    use std::thread;
    use std::time::{Duration, Instant};

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![seq as u8; 3], FrameShape::bgr(1, 1), seq).unwrap()
    }

    #[test]
    fn test_empty_until_first_put() {
        let slot = LatestFrameSlot::new();
        assert!(slot.get().is_none());
        assert!(slot.get().is_none());
        slot.put(frame(1));
        assert_eq!(slot.get().unwrap().sequence(), 1);
    }

    #[test]
    fn test_latest_wins() {
        let slot = LatestFrameSlot::new();
        for seq in 1..=5 {
            slot.put(frame(seq));
        }
        assert_eq!(slot.get().unwrap().sequence(), 5);
        assert_eq!(
            slot.stats(),
            SlotStats {
                written: 5,
                read: 1,
                coalesced: 4
            }
        );
    }

    #[test]
    fn test_drained_slot_returns_last() {
        let slot = LatestFrameSlot::new();
        slot.put(frame(1));
        slot.put(frame(2));
        assert!(slot.has_unread());
        assert_eq!(slot.get().unwrap().sequence(), 2);
        assert!(!slot.has_unread());
        // Nothing unread: repeat the most recent frame
        assert_eq!(slot.get().unwrap().sequence(), 2);
        assert_eq!(slot.get().unwrap().sequence(), 2);
        slot.put(frame(3));
        assert_eq!(slot.get().unwrap().sequence(), 3);
    }

    #[test]
    fn test_put_never_blocks_under_contention() {
        let slot = Arc::new(LatestFrameSlot::new());
        let producer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let start = Instant::now();
                for seq in 1..=10_000 {
                    slot.put(frame(seq));
                }
                start.elapsed()
            })
        };

        let mut last_seen = 0;
        while !producer.is_finished() {
            if let Some(frame) = slot.get() {
                // Capture order is preserved
                assert!(frame.sequence() >= last_seen);
                last_seen = frame.sequence();
            }
        }
        let elapsed = producer.join().unwrap();
        assert!(elapsed < Duration::from_secs(10));
        assert_eq!(slot.get().unwrap().sequence(), 10_000);
    }
}
