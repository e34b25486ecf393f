//! Audio Frame Bus (spec.md §4.1): a per-session pair of bounded,
//! order-preserving queues connecting the transport to the active session.

use crate::model::AudioFrame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Queue depth chosen so capacity covers the jitter-buffer budget
/// (≥ 200 ms at 20 ms/frame).
pub const DEFAULT_CAPACITY_FRAMES: usize = 10;

/// Shared counters surfaced alongside a direction's queue.
#[derive(Debug, Default)]
struct DirectionStats {
    dropped_oldest: AtomicU64,
    last_seq: AtomicU64,
    has_last_seq: std::sync::atomic::AtomicBool,
    gaps_detected: AtomicU64,
}

/// A single bounded, order-preserving, drop-oldest-on-full frame queue.
pub struct FrameQueue {
    inner: parking_lot::Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    stats: DirectionStats,
}

impl FrameQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            stats: DirectionStats::default(),
        }
    }

    /// Enqueue a frame. Never blocks: when full, drops the oldest frame and
    /// increments the backpressure counter (spec.md §4.1).
    pub fn push(&self, frame: AudioFrame) {
        self.detect_gap(frame.seq);
        let mut guard = self.inner.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.stats.dropped_oldest.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(frame);
    }

    /// Dequeue the oldest frame, if any.
    pub fn pop(&self) -> Option<AudioFrame> {
        self.inner.lock().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dropped_oldest_count(&self) -> u64 {
        self.stats.dropped_oldest.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn gaps_detected_count(&self) -> u64 {
        self.stats.gaps_detected.load(Ordering::Relaxed)
    }

    fn detect_gap(&self, seq: u64) {
        if self.stats.has_last_seq.load(Ordering::Relaxed) {
            let last = self.stats.last_seq.load(Ordering::Relaxed);
            if seq > last + 1 {
                self.stats.gaps_detected.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.stats.has_last_seq.store(true, Ordering::Relaxed);
        }
        self.stats.last_seq.store(seq, Ordering::Relaxed);
    }
}

/// A per-session pair of inbound/outbound queues. Not shared across calls
/// (spec.md §4.1 "The bus is not shared across calls"). Cloning shares the
/// same underlying queues (the `Arc`s are cloned, not the frames) so the
/// transport and the active session can be handed the same bus instance.
#[derive(Clone)]
pub struct AudioFrameBus {
    pub inbound: Arc<FrameQueue>,
    pub outbound: Arc<FrameQueue>,
}

impl AudioFrameBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inbound: Arc::new(FrameQueue::new(capacity)),
            outbound: Arc::new(FrameQueue::new(capacity)),
        }
    }
}

impl Default for AudioFrameBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_FRAMES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame::silence(seq, (seq * 20) as u32)
    }

    #[test]
    fn fifo_order_preserved_under_capacity() {
        let q = FrameQueue::new(4);
        q.push(frame(0));
        q.push(frame(1));
        q.push(frame(2));
        assert_eq!(q.pop().unwrap().seq, 0);
        assert_eq!(q.pop().unwrap().seq, 1);
        assert_eq!(q.pop().unwrap().seq, 2);
    }

    #[test]
    fn full_queue_drops_oldest_and_counts_backpressure() {
        let q = FrameQueue::new(2);
        q.push(frame(0));
        q.push(frame(1));
        q.push(frame(2));
        assert_eq!(q.dropped_oldest_count(), 1);
        assert_eq!(q.pop().unwrap().seq, 1);
        assert_eq!(q.pop().unwrap().seq, 2);
        assert!(q.is_empty());
    }

    #[test]
    fn non_contiguous_seq_increments_gap_counter() {
        let q = FrameQueue::new(10);
        q.push(frame(0));
        q.push(frame(1));
        q.push(frame(5));
        assert_eq!(q.gaps_detected_count(), 1);
    }

    #[test]
    fn push_never_blocks_even_when_full() {
        let q = FrameQueue::new(1);
        for seq in 0..1000 {
            q.push(frame(seq));
        }
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn bus_provides_independent_inbound_outbound_queues() {
        let bus = AudioFrameBus::default();
        bus.inbound.push(frame(0));
        assert_eq!(bus.inbound.len(), 1);
        assert_eq!(bus.outbound.len(), 0);
    }
}
