//! Trailing-rotation slot ring for low-latency single-sample transfer.
//!
//! Three slots rotate between one producer (the network receiver) and one
//! consumer (the control cycle):
//!
//! - the producer writes slot `(write_index + 1) % 3`
//! - on release, `write_index` advances to that slot
//! - the consumer reads slot `(write_index + 2) % 3`, the slot released
//!   one rotation earlier
//!
//! The consumer therefore trails the producer by exactly one slot and never
//! touches the slot being written. Reads never block on the producer and never
//! fail; if the producer stalled, the consumer keeps getting the same slot and
//! sees its unchanged capture timestamp.
//!
//! The producer fills its slot without any lock. Only the index advance and
//! the consumer's copy take the ring's [`SpinLock`], which keeps the producer
//! from rotating into the slot the consumer is copying.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::atomic::AtomicWord;
use crate::error::{Result, SetupError};
use crate::slot::SlotRegion;
use crate::spin::SpinLock;

/// Number of slots in a trailing ring.
pub const TRAILING_SLOTS: usize = 3;

/// Result of a consumer read from a trailing ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingRead {
    /// The slot that was copied.
    pub index: usize,
    /// Capture timestamp embedded in the slot, 0 if never written.
    pub timestamp_us: u64,
    /// Number of releases the ring had seen when the copy was taken.
    pub generation: u64,
}

impl TrailingRead {
    /// Whether the copied slot has ever been written.
    pub fn has_data(&self) -> bool {
        self.timestamp_us != 0
    }
}

/// Three-slot trailing-rotation ring.
#[derive(Debug)]
pub struct TrailingRing {
    region: SlotRegion,
    /// Index of the most recently released slot.
    write_index: AtomicU32,
    /// Count of releases; only the producer increments it.
    generation: AtomicU64,
    /// Serializes the index advance against the consumer's copy.
    lock: SpinLock<()>,
    /// Test-and-set flag for the single producer handle.
    producer_claimed: AtomicU32,
}

impl TrailingRing {
    /// Allocates a ring whose slots hold `slot_size` bytes each.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::SlotStorage`] if the slot storage cannot be mapped.
    pub fn new(slot_size: usize) -> Result<Self> {
        Ok(Self {
            region: SlotRegion::new(TRAILING_SLOTS, slot_size)?,
            write_index: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            lock: SpinLock::new(()),
            producer_claimed: AtomicU32::new(0),
        })
    }

    /// Payload bytes per slot.
    pub fn slot_size(&self) -> usize {
        self.region.slot_size()
    }

    /// Index of the most recently released slot.
    pub fn write_index(&self) -> usize {
        self.write_index.load(Ordering::Acquire) as usize
    }

    /// Index the producer writes next: `(write_index + 1) % 3`.
    pub fn next_write_slot(&self) -> usize {
        (self.write_index() + 1) % TRAILING_SLOTS
    }

    /// Index the consumer reads: `(write_index + 2) % 3`.
    pub fn acquire_read_slot(&self) -> usize {
        (self.write_index() + 2) % TRAILING_SLOTS
    }

    /// Number of slots released so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Copies the trailing slot into `out`.
    ///
    /// Never blocks on the producer's copy, only on its index advance, which
    /// is a handful of instructions.
    ///
    /// # Panics
    ///
    /// Panics if `out` is longer than the slot size.
    pub fn read_into(&self, out: &mut [u8]) -> TrailingRead {
        assert!(
            out.len() <= self.region.slot_size(),
            "read of {} bytes from {} byte slots",
            out.len(),
            self.region.slot_size()
        );

        let _guard = self.lock.acquire();
        let index = self.acquire_read_slot();
        // SAFETY: The producer only writes next_write_slot(), which differs
        // from the read slot, and cannot advance while we hold the lock.
        let timestamp_us = unsafe {
            self.region.read_payload(index, out);
            self.region.timestamp(index)
        };

        TrailingRead {
            index,
            timestamp_us,
            generation: self.generation(),
        }
    }

    /// Claims the single producer handle of this ring.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::ProducerClaimed`] if a producer already exists.
    pub fn claim_producer(self: &Arc<Self>) -> Result<TrailingProducer> {
        if !self.producer_claimed.test_and_set() {
            return Err(SetupError::ProducerClaimed.into());
        }
        Ok(TrailingProducer {
            ring: Arc::clone(self),
        })
    }

    fn release_write_slot(&self, index: usize) {
        let _guard = self.lock.acquire();
        #[allow(clippy::cast_possible_truncation)] // index < TRAILING_SLOTS
        self.write_index.store(index as u32, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// The one writer of a [`TrailingRing`].
///
/// Dropping the producer frees the claim so another can be taken.
#[derive(Debug)]
pub struct TrailingProducer {
    ring: Arc<TrailingRing>,
}

impl TrailingProducer {
    /// The ring this producer writes.
    pub fn ring(&self) -> &Arc<TrailingRing> {
        &self.ring
    }

    /// Starts writing the next slot.
    pub fn acquire_write_slot(&mut self) -> WriteSlot<'_> {
        let index = self.ring.next_write_slot();
        WriteSlot {
            ring: &self.ring,
            index,
        }
    }

    /// Writes `payload` stamped with `timestamp_us` and releases the slot.
    ///
    /// Returns the released slot index.
    ///
    /// # Panics
    ///
    /// Panics if `payload` is longer than the slot size.
    pub fn publish(&mut self, payload: &[u8], timestamp_us: u64) -> usize {
        let mut slot = self.acquire_write_slot();
        slot.write(payload);
        slot.release(timestamp_us)
    }
}

impl Drop for TrailingProducer {
    fn drop(&mut self) {
        self.ring.producer_claimed.exchange(0);
    }
}

/// A slot held for writing by the producer.
///
/// Not releasing it leaves the ring unchanged.
#[derive(Debug)]
pub struct WriteSlot<'a> {
    ring: &'a TrailingRing,
    index: usize,
}

impl WriteSlot<'_> {
    /// The slot index being written.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Copies `payload` into the slot.
    ///
    /// # Panics
    ///
    /// Panics if `payload` is longer than the slot size.
    pub fn write(&mut self, payload: &[u8]) {
        assert!(
            payload.len() <= self.ring.region.slot_size(),
            "write of {} bytes into {} byte slots",
            payload.len(),
            self.ring.region.slot_size()
        );
        // SAFETY: The consumer reads (write_index + 2) % 3, never this slot,
        // and the producer is unique, so nothing else touches it.
        unsafe { self.ring.region.write_payload(self.index, payload) }
    }

    /// Stamps the slot, marks it full and makes it the ring's write index.
    pub fn release(self, timestamp_us: u64) -> usize {
        // SAFETY: Exclusive as in `write`.
        unsafe { self.ring.region.set_timestamp(self.index, timestamp_us) }
        self.ring.release_write_slot(self.index);
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(slot_size: usize) -> Arc<TrailingRing> {
        Arc::new(TrailingRing::new(slot_size).unwrap())
    }

    #[test]
    fn test_initial_indices() {
        let ring = ring(8);
        assert_eq!(ring.write_index(), 0);
        assert_eq!(ring.next_write_slot(), 1);
        assert_eq!(ring.acquire_read_slot(), 2);
        assert_eq!(ring.generation(), 0);
    }

    #[test]
    fn test_empty_read_has_no_data() {
        let ring = ring(4);
        let mut out = [7u8; 4];
        let read = ring.read_into(&mut out);
        assert!(!read.has_data());
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn test_consumer_trails_by_one_slot() {
        let ring = ring(4);
        let mut producer = ring.claim_producer().unwrap();
        let mut out = [0u8; 4];

        assert_eq!(producer.publish(&[1; 4], 100), 1);
        // Only one release: the trailing slot is still the untouched slot 0.
        assert!(!ring.read_into(&mut out).has_data());

        assert_eq!(producer.publish(&[2; 4], 200), 2);
        let read = ring.read_into(&mut out);
        assert_eq!(read.index, 1);
        assert_eq!(read.timestamp_us, 100);
        assert_eq!(out, [1; 4]);

        assert_eq!(producer.publish(&[3; 4], 300), 0);
        let read = ring.read_into(&mut out);
        assert_eq!(read.index, 2);
        assert_eq!(read.timestamp_us, 200);
        assert_eq!(read.generation, 3);
        assert_eq!(out, [2; 4]);
    }

    #[test]
    fn test_stalled_producer_exposes_same_timestamp() {
        let ring = ring(2);
        let mut producer = ring.claim_producer().unwrap();
        producer.publish(&[1, 1], 10);
        producer.publish(&[2, 2], 20);

        let mut out = [0u8; 2];
        let first = ring.read_into(&mut out);
        let second = ring.read_into(&mut out);
        assert_eq!(first, second);
        assert_eq!(second.timestamp_us, 10);
    }

    #[test]
    fn test_read_slot_never_equals_write_slot() {
        let ring = ring(1);
        let mut producer = ring.claim_producer().unwrap();
        let mut out = [0u8; 1];

        // Deterministic mix of writes and reads.
        let mut state = 0x2545_f491u32;
        for step in 0..1_000u64 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;

            if state % 3 == 0 {
                ring.read_into(&mut out);
            } else {
                let mut slot = producer.acquire_write_slot();
                assert_ne!(slot.index(), ring.acquire_read_slot());
                slot.write(&[1]);
                slot.release(step + 1);
            }
            assert_ne!(ring.acquire_read_slot(), ring.next_write_slot());
        }
    }

    #[test]
    fn test_unreleased_slot_changes_nothing() {
        let ring = ring(1);
        let mut producer = ring.claim_producer().unwrap();
        {
            let mut slot = producer.acquire_write_slot();
            slot.write(&[9]);
        }
        assert_eq!(ring.write_index(), 0);
        assert_eq!(ring.generation(), 0);
    }

    #[test]
    fn test_single_producer_claim() {
        let ring = ring(1);
        let producer = ring.claim_producer().unwrap();
        assert!(ring.claim_producer().is_err());
        drop(producer);
        assert!(ring.claim_producer().is_ok());
    }

    #[test]
    fn test_concurrent_reads_are_never_torn() {
        const SLOT: usize = 256;
        let ring = ring(SLOT);
        let mut producer = ring.claim_producer().unwrap();

        let writer = std::thread::spawn(move || {
            for i in 1..=20_000u64 {
                #[allow(clippy::cast_possible_truncation)]
                let fill = (i % 251) as u8;
                producer.publish(&[fill; SLOT], i);
            }
        });

        let mut out = [0u8; SLOT];
        let mut last_ts = 0;
        while !writer.is_finished() {
            let read = ring.read_into(&mut out);
            if read.has_data() {
                assert!(out.iter().all(|&b| b == out[0]), "torn slot");
                #[allow(clippy::cast_possible_truncation)]
                let expected = (read.timestamp_us % 251) as u8;
                assert_eq!(out[0], expected);
                assert!(read.timestamp_us >= last_ts);
                last_ts = read.timestamp_us;
            }
        }
        writer.join().unwrap();
    }
}
