//! Bounded history of raw frame snapshots for temporal differencing

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

#[derive(Default)]
struct Stats {
    snapshots_allocated: AtomicUsize,
    snapshots_freed: AtomicUsize,
}

/// Owned copy of one frame's plane data. Counted as freed when dropped.
pub struct Snapshot {
    data: Box<[u8]>,
    stats: Arc<CachePadded<Stats>>,
}

impl Deref for Snapshot {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.stats.snapshots_freed.fetch_add(1, Ordering::Relaxed);
    }
}

/// FIFO of at most `capacity` snapshots
pub struct MotionHistoryRing {
    ring: HeapRb<Snapshot>,
    capacity: usize,

    /// Statistics
    stats: Arc<CachePadded<Stats>>,
}

impl MotionHistoryRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: HeapRb::new(capacity),
            capacity,
            stats: Arc::new(CachePadded::new(Stats::default())),
        }
    }

    /// Copy `data` into a new snapshot at the back of the ring.
    ///
    /// Returns false, copying nothing, if the ring is already full.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if self.ring.is_full() {
            return false;
        }
        self.stats.snapshots_allocated.fetch_add(1, Ordering::Relaxed);
        let snapshot = Snapshot {
            data: Box::from(data),
            stats: self.stats.clone(),
        };
        self.ring.try_push(snapshot).is_ok()
    }

    /// Remove the oldest snapshot; it is freed when the caller drops it.
    pub fn pop(&mut self) -> Option<Snapshot> {
        self.ring.try_pop()
    }

    pub fn peek(&self) -> Option<&[u8]> {
        self.ring.try_peek().map(|snapshot| &snapshot[..])
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Free every retained snapshot, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let mut freed = 0;
        while self.ring.try_pop().is_some() {
            freed += 1;
        }
        freed
    }

    /// (allocated, freed) snapshot counts since creation
    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.snapshots_allocated.load(Ordering::Relaxed),
            self.stats.snapshots_freed.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_fifo() {
        let mut ring = MotionHistoryRing::new(2);
        assert!(ring.push(&[1]));
        assert!(ring.push(&[2]));
        assert!(ring.is_full());
        assert!(!ring.push(&[3]));
        assert_eq!(ring.len(), 2);

        assert_eq!(ring.peek(), Some(&[1u8][..]));
        assert_eq!(&*ring.pop().unwrap(), &[1]);
        assert_eq!(&*ring.pop().unwrap(), &[2]);
        assert!(ring.pop().is_none());
    }

    #[test]
    fn every_snapshot_freed_once() {
        let mut ring = MotionHistoryRing::new(3);
        ring.push(&[0; 16]);
        ring.push(&[0; 16]);
        let popped = ring.pop().unwrap();
        assert_eq!(ring.stats(), (2, 0));
        drop(popped);
        assert_eq!(ring.stats(), (2, 1));
        ring.push(&[0; 16]);
        assert_eq!(ring.clear(), 2);
        assert_eq!(ring.stats(), (3, 3));
        assert!(ring.is_empty());
    }
}
