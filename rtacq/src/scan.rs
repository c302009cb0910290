//! Lock/free-scan slot ring for batched transfer.
//!
//! Each slot carries its own [`LockState`] and [`FullState`] word. The
//! producer never blocks: it scans for the next unlocked slot starting just
//! after the last one it used, and when every slot is locked it drops the
//! unit and counts a lost buffer instead of waiting.
//!
//! # Slot state transitions
//!
//! ```text
//! producer: Unlocked -> Locked (scan)  -> write -> Full + Unlocked (commit)
//!                                       -> Unlocked, fullness unchanged (abandon)
//! consumer: Unlocked -> Locked (scan)  -> Full:  copy -> Free + Unlocked
//!                                       -> Free:  Unlocked, try next slot
//! ```
//!
//! The producer may lock and overwrite a slot that is still Full; the unread
//! unit is replaced by newer data and counted as an overrun. The consumer
//! never sees a Locked slot's content.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::atomic::AtomicWord;
use crate::error::Result;
use crate::slot::SlotRegion;

/// Whether a slot is held by the producer or the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LockState {
    /// Nobody holds the slot.
    Unlocked = 0,
    /// The producer or the consumer is working on the slot.
    Locked = 1,
}

/// Whether a slot holds a unit the consumer has not read yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FullState {
    /// Empty or already consumed.
    Free = 0,
    /// Holds an unread unit.
    Full = 1,
}

/// Result of a consumer read from a scan ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRead {
    /// The slot that was copied.
    pub index: usize,
    /// Capture timestamp embedded in the slot.
    pub timestamp_us: u64,
}

/// Slot ring with per-slot lock and full flags.
#[derive(Debug)]
pub struct ScanRing {
    region: SlotRegion,
    lock_states: Box<[AtomicU32]>,
    full_states: Box<[AtomicU32]>,
    /// Cache of the last slot the producer found unlocked.
    last_unlocked: AtomicU32,
    /// Last slot the consumer read.
    last_read: AtomicU32,
    lost_buffers: AtomicU64,
    overruns: AtomicU64,
}

impl ScanRing {
    /// Allocates `slot_count` slots of `slot_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::SlotStorage`](crate::error::SetupError::SlotStorage)
    /// if the slot storage cannot be mapped.
    ///
    /// # Panics
    ///
    /// Panics if `slot_count` is zero or does not fit in a `u32`.
    pub fn new(slot_count: usize, slot_size: usize) -> Result<Self> {
        assert!(
            slot_count > 0 && u32::try_from(slot_count).is_ok(),
            "invalid scan ring size {slot_count}"
        );
        #[allow(clippy::cast_possible_truncation)] // checked above
        let last = (slot_count - 1) as u32;
        let states = |_| AtomicU32::new(0);

        Ok(Self {
            region: SlotRegion::new(slot_count, slot_size)?,
            lock_states: (0..slot_count).map(states).collect(),
            full_states: (0..slot_count).map(states).collect(),
            // Scanning starts just after the cached index, i.e. at slot 0.
            last_unlocked: AtomicU32::new(last),
            last_read: AtomicU32::new(last),
            lost_buffers: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        })
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.region.slot_count()
    }

    /// Payload bytes per slot.
    pub fn slot_size(&self) -> usize {
        self.region.slot_size()
    }

    /// Units dropped because no slot was unlocked.
    pub fn lost_buffers(&self) -> u64 {
        self.lost_buffers.load(Ordering::Relaxed)
    }

    /// Unread units replaced by newer ones.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// The cached index the next producer scan starts after.
    pub fn last_unlocked_index(&self) -> usize {
        self.last_unlocked.load(Ordering::Relaxed) as usize
    }

    /// Current lock state of slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn lock_state(&self, index: usize) -> LockState {
        match self.lock_states[index].value() {
            0 => LockState::Unlocked,
            _ => LockState::Locked,
        }
    }

    /// Current full state of slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn full_state(&self, index: usize) -> FullState {
        match self.full_states[index].value() {
            0 => FullState::Free,
            _ => FullState::Full,
        }
    }

    /// Locks and returns the first unlocked slot after the cached index.
    ///
    /// Returns `None` when every slot is locked; the lost-buffer counter is
    /// incremented and no other state changes.
    pub fn find_next_unlocked_slot(&self) -> Option<LockedSlot<'_>> {
        let count = self.slot_count();
        let start = self.last_unlocked_index();

        for step in 1..=count {
            let index = (start + step) % count;
            if let Some(slot) = self.try_lock_slot(index) {
                #[allow(clippy::cast_possible_truncation)] // index < slot_count <= u32::MAX
                self.last_unlocked.store(index as u32, Ordering::Relaxed);
                return Some(slot);
            }
        }

        self.lost_buffers.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Locks slot `index` if it is unlocked.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn try_lock_slot(&self, index: usize) -> Option<LockedSlot<'_>> {
        if self.lock_states[index].test_and_set() {
            Some(LockedSlot {
                ring: self,
                index,
                committed: false,
            })
        } else {
            None
        }
    }

    /// Copies the next unread unit into `out`.
    ///
    /// Slots are visited in ring order after the last one read; Locked and
    /// Free slots are skipped. Returns `None` when nothing new is available.
    ///
    /// # Panics
    ///
    /// Panics if `out` is longer than the slot size.
    pub fn read_next(&self, out: &mut [u8]) -> Option<ScanRead> {
        assert!(
            out.len() <= self.slot_size(),
            "read of {} bytes from {} byte slots",
            out.len(),
            self.slot_size()
        );

        let count = self.slot_count();
        let start = self.last_read.load(Ordering::Relaxed) as usize;

        for step in 1..=count {
            let index = (start + step) % count;
            if !self.lock_states[index].test_and_set() {
                continue;
            }

            let read = if self.full_states[index].value() != 0 {
                // SAFETY: We hold the slot's lock word, so the producer cannot
                // be writing it.
                let timestamp_us = unsafe {
                    self.region.read_payload(index, out);
                    self.region.timestamp(index)
                };
                self.full_states[index].exchange(FullState::Free as u32);
                #[allow(clippy::cast_possible_truncation)] // index < slot_count <= u32::MAX
                self.last_read.store(index as u32, Ordering::Relaxed);
                Some(ScanRead {
                    index,
                    timestamp_us,
                })
            } else {
                None
            };

            self.lock_states[index].exchange(LockState::Unlocked as u32);
            if read.is_some() {
                return read;
            }
        }

        None
    }
}

/// A slot locked by the caller.
///
/// Dropping it without [`commit`](LockedSlot::commit) unlocks the slot and
/// leaves its full state as it was.
#[derive(Debug)]
pub struct LockedSlot<'a> {
    ring: &'a ScanRing,
    index: usize,
    committed: bool,
}

impl LockedSlot<'_> {
    /// The locked slot index.
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
            payload.len() <= self.ring.slot_size(),
            "write of {} bytes into {} byte slots",
            payload.len(),
            self.ring.slot_size()
        );
        // SAFETY: We hold the slot's lock word.
        unsafe { self.ring.region.write_payload(self.index, payload) }
    }

    /// Stamps the slot, marks it Full and unlocks it.
    pub fn commit(mut self, timestamp_us: u64) {
        // SAFETY: We hold the slot's lock word.
        unsafe { self.ring.region.set_timestamp(self.index, timestamp_us) }
        let previous = self.ring.full_states[self.index].exchange(FullState::Full as u32);
        if previous != 0 {
            self.ring.overruns.fetch_add(1, Ordering::Relaxed);
        }
        self.committed = true;
        self.ring.lock_states[self.index].exchange(LockState::Unlocked as u32);
    }
}

impl Drop for LockedSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.ring.lock_states[self.index].exchange(LockState::Unlocked as u32);
        }
    }
}
