//! Preallocated slot storage shared by both ring variants.
//!
//! A [`SlotRegion`] is one anonymous memory mapping carved into fixed-size
//! slots. It is allocated once at ring construction and never resized, so the
//! data path performs no allocation.
//!
//! # Layout
//!
//! ```text
//! slot i at i * stride:
//! [0..8)        capture timestamp, µs (u64, native order)
//! [8..16)       reserved
//! [16..16+P)    payload (P = slot_size)
//! [16+P..stride) padding to a cache-line multiple
//! ```
//!
//! # Safety
//!
//! The region hands out raw slot access to its ring. It does not decide who
//! may touch which slot; that is the ring's rotation or lock policy. All
//! accessors are `unsafe` and `pub(crate)` for that reason.

use std::ptr::{self, NonNull};

use memmap2::MmapMut;

use crate::error::{Result, SetupError};

/// Size of the per-slot header in bytes.
pub const SLOT_HEADER_SIZE: usize = 16;

/// Slot stride alignment, one cache line.
const SLOT_ALIGN: usize = 64;

/// Fixed set of preallocated slots backed by an anonymous mapping.
#[derive(Debug)]
pub struct SlotRegion {
    /// Keeps the mapping alive; never dereferenced after construction.
    _mmap: MmapMut,
    /// Base of the mapping.
    base: NonNull<u8>,
    slot_count: usize,
    slot_size: usize,
    stride: usize,
}

// SAFETY: The region owns its mapping. Concurrent access to individual slots
// is governed by the owning ring, which is the only caller of the unsafe
// accessors.
unsafe impl Send for SlotRegion {}

// SAFETY: See above. Shared references only expose sizes; slot access goes
// through `unsafe` accessors whose contracts the rings uphold.
unsafe impl Sync for SlotRegion {}

impl SlotRegion {
    /// Maps storage for `slot_count` slots of `slot_size` payload bytes.
    ///
    /// All timestamps and payload bytes start at zero.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::SlotStorage`] if the mapping fails.
    ///
    /// # Panics
    ///
    /// Panics if `slot_count` is zero.
    pub fn new(slot_count: usize, slot_size: usize) -> Result<Self> {
        assert!(slot_count > 0, "a slot region needs at least one slot");

        let stride = (SLOT_HEADER_SIZE + slot_size).div_ceil(SLOT_ALIGN) * SLOT_ALIGN;
        let bytes = stride * slot_count;

        let mut mmap = MmapMut::map_anon(bytes)
            .map_err(|source| SetupError::SlotStorage { bytes, source })?;

        // Anonymous mappings are zero-filled and never null.
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| SetupError::SlotStorage {
            bytes,
            source: std::io::Error::other("mapping returned a null base"),
        })?;

        tracing::debug!(slot_count, slot_size, stride, bytes, "mapped slot region");

        Ok(Self {
            _mmap: mmap,
            base,
            slot_count,
            slot_size,
            stride,
        })
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Payload bytes per slot.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Distance in bytes between two consecutive slots.
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    fn slot_ptr(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < self.slot_count, "slot {idx} out of {}", self.slot_count);
        // SAFETY: idx < slot_count, so the offset stays inside the mapping.
        unsafe { self.base.as_ptr().add(idx * self.stride) }
    }

    /// Stores the capture timestamp of slot `idx`.
    ///
    /// # Safety
    ///
    /// `idx < slot_count`, and the caller has exclusive access to the slot.
    #[inline]
    pub(crate) unsafe fn set_timestamp(&self, idx: usize, timestamp_us: u64) {
        // SAFETY: Slot starts are 64-byte aligned within a page-aligned
        // mapping; exclusivity is the caller's contract.
        unsafe { ptr::write(self.slot_ptr(idx).cast::<u64>(), timestamp_us) }
    }

    /// Loads the capture timestamp of slot `idx`.
    ///
    /// # Safety
    ///
    /// `idx < slot_count`, and no writer is active on the slot.
    #[inline]
    pub(crate) unsafe fn timestamp(&self, idx: usize) -> u64 {
        // SAFETY: Aligned as in `set_timestamp`; the caller excludes writers.
        unsafe { ptr::read(self.slot_ptr(idx).cast::<u64>()) }
    }

    /// Copies `src` into the payload of slot `idx`.
    ///
    /// # Safety
    ///
    /// `idx < slot_count`, `src.len() <= slot_size`, and the caller has
    /// exclusive access to the slot.
    #[inline]
    pub(crate) unsafe fn write_payload(&self, idx: usize, src: &[u8]) {
        debug_assert!(src.len() <= self.slot_size);
        // SAFETY: The payload area holds slot_size bytes after the header and
        // cannot overlap `src`, which lives outside the mapping or in another
        // slot.
        unsafe {
            ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.slot_ptr(idx).add(SLOT_HEADER_SIZE),
                src.len(),
            );
        }
    }

    /// Copies the payload of slot `idx` into `dst`.
    ///
    /// # Safety
    ///
    /// `idx < slot_count`, `dst.len() <= slot_size`, and no writer is active
    /// on the slot.
    #[inline]
    pub(crate) unsafe fn read_payload(&self, idx: usize, dst: &mut [u8]) {
        debug_assert!(dst.len() <= self.slot_size);
        // SAFETY: As in `write_payload`, with source and destination swapped.
        unsafe {
            ptr::copy_nonoverlapping(
                self.slot_ptr(idx).add(SLOT_HEADER_SIZE),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
    }
}
