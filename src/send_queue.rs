//! Bounded ordered byte queue feeding the upstream STT socket.
//!
//! Audio arrives in small packets and leaves in coalesced batches. The queue
//! only does bookkeeping; the cooperative drain loop that ships batches (and
//! the Finalize/CloseStream control messages once empty) lives in the STT
//! adapter, which owns the upstream link and the control flags.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Don't bother shipping batches smaller than this unless flushing.
pub const MIN_BATCH_BYTES: usize = 3200;
/// Upper bound on a single coalesced frame.
pub const MAX_BATCH_BYTES: usize = 16_000;
/// Queue cap; overflow drops from the head.
pub const MAX_QUEUE_BYTES: usize = 2 * 1024 * 1024;
/// Batches shipped per drain turn before yielding.
pub const MAX_BATCHES_PER_TURN: usize = 8;
/// Wall-clock limit per drain turn.
pub const MAX_SLICE_MS: u64 = 10;

#[derive(Default)]
pub struct SendQueue {
    entries: Mutex<VecDeque<Bytes>>,
    queued_bytes: AtomicUsize,
    draining: AtomicBool,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer, dropping from the head while over the cap.
    pub fn enqueue(&self, buf: Bytes) {
        let mut entries = self.entries.lock().unwrap();
        self.queued_bytes.fetch_add(buf.len(), Ordering::SeqCst);
        entries.push_back(buf);

        let mut dropped = 0usize;
        while self.queued_bytes.load(Ordering::SeqCst) > MAX_QUEUE_BYTES {
            match entries.pop_front() {
                Some(old) => {
                    self.queued_bytes.fetch_sub(old.len(), Ordering::SeqCst);
                    dropped += old.len();
                }
                None => break,
            }
        }
        if dropped > 0 {
            eprintln!(
                "[SendQueue] Overflow: dropped {} bytes from the head ({} queued)",
                dropped,
                self.queued_bytes.load(Ordering::SeqCst)
            );
        }
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.queued_bytes() == 0
    }

    /// Pop entries from the head into one coalesced frame: stop before the
    /// batch would exceed `MAX_BATCH_BYTES`, but always ship at least one
    /// entry.
    pub fn pop_batch(&self) -> Option<Bytes> {
        let mut entries = self.entries.lock().unwrap();
        let first = entries.pop_front()?;
        self.queued_bytes.fetch_sub(first.len(), Ordering::SeqCst);
        if first.len() >= MAX_BATCH_BYTES {
            return Some(first);
        }

        let mut batch = BytesMut::from(&first[..]);
        while let Some(next) = entries.front() {
            if batch.len() + next.len() > MAX_BATCH_BYTES {
                break;
            }
            let next = entries.pop_front().unwrap();
            self.queued_bytes.fetch_sub(next.len(), Ordering::SeqCst);
            batch.extend_from_slice(&next);
        }
        Some(batch.freeze())
    }

    /// Claim drain exclusivity. Returns false when another drain holds it.
    pub fn try_begin_drain(&self) -> bool {
        !self.draining.swap(true, Ordering::SeqCst)
    }

    pub fn end_drain(&self) {
        self.draining.store(false, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.clear();
        self.queued_bytes.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn test_enqueue_accounts_bytes() {
        let q = SendQueue::new();
        q.enqueue(bytes_of(100, 1));
        q.enqueue(bytes_of(200, 2));
        assert_eq!(q.queued_bytes(), 300);
    }

    #[test]
    fn test_overflow_drops_from_head() {
        let q = SendQueue::new();
        q.enqueue(bytes_of(MAX_QUEUE_BYTES, 1));
        q.enqueue(bytes_of(10, 2));
        assert!(q.queued_bytes() <= MAX_QUEUE_BYTES);
        // The survivor is the newer entry.
        let batch = q.pop_batch().unwrap();
        assert_eq!(batch.len(), 10);
        assert_eq!(batch[0], 2);
    }

    #[test]
    fn test_pop_batch_coalesces_up_to_cap() {
        let q = SendQueue::new();
        for i in 0..10u8 {
            q.enqueue(bytes_of(3000, i));
        }
        let batch = q.pop_batch().unwrap();
        // 3000 * 5 = 15000 fits; adding a sixth would exceed 16000.
        assert_eq!(batch.len(), 15_000);
        assert_eq!(q.queued_bytes(), 15_000);
    }

    #[test]
    fn test_pop_batch_ships_oversized_entry_alone() {
        let q = SendQueue::new();
        q.enqueue(bytes_of(MAX_BATCH_BYTES + 500, 7));
        q.enqueue(bytes_of(10, 8));
        let batch = q.pop_batch().unwrap();
        assert_eq!(batch.len(), MAX_BATCH_BYTES + 500);
        assert_eq!(q.queued_bytes(), 10);
    }

    #[test]
    fn test_order_preserved_across_batches() {
        let q = SendQueue::new();
        let mut expected = Vec::new();
        for i in 0..20u8 {
            let buf = bytes_of(2000, i);
            expected.extend_from_slice(&buf);
            q.enqueue(buf);
        }
        let mut observed = Vec::new();
        while let Some(batch) = q.pop_batch() {
            observed.extend_from_slice(&batch);
        }
        assert_eq!(observed, expected);
        assert!(q.is_empty());
    }

    #[test]
    fn test_drain_exclusivity() {
        let q = SendQueue::new();
        assert!(q.try_begin_drain());
        assert!(!q.try_begin_drain());
        q.end_drain();
        assert!(q.try_begin_drain());
    }
}
