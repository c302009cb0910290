//! Portable atomic word primitives.
//!
//! One contract for 8, 16 and 32-bit words: indivisible increment, decrement,
//! exchange and test-and-set. Everything lock-like in this crate (the
//! [`SpinLock`](crate::spin::SpinLock), slot lock states, the receiver
//! liveness flag) is built from these four operations.
//!
//! # Core safety
//!
//! Cross-core safety is a build-time capability, not an assumption. The
//! default build is [`CoreSafety::MultiCore`]: synchronizing operations use
//! sequentially consistent ordering. Building with the `single-core` feature
//! declares a uniprocessor target; operations stay indivisible but use relaxed
//! ordering fenced against compiler reordering only.

use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, Ordering, compiler_fence};

/// Whether atomic words are safe across execution units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreSafety {
    /// Indivisible on one execution unit only.
    SingleCore,
    /// Indivisible and ordered across all execution units.
    MultiCore,
}

/// The core-safety mode this crate was built with.
pub const CORE_SAFETY: CoreSafety = if cfg!(feature = "single-core") {
    CoreSafety::SingleCore
} else {
    CoreSafety::MultiCore
};

impl CoreSafety {
    /// Memory ordering used for synchronizing operations in this mode.
    pub const fn sync_ordering(self) -> Ordering {
        match self {
            Self::SingleCore => Ordering::Relaxed,
            Self::MultiCore => Ordering::SeqCst,
        }
    }
}

#[inline]
fn single_core_fence() {
    if matches!(CORE_SAFETY, CoreSafety::SingleCore) {
        compiler_fence(Ordering::SeqCst);
    }
}

/// An atomic machine word usable as a counter, flag or lock.
///
/// Natural alignment is guaranteed by the implementing types, so the
/// misaligned-address hazard of raw pointer atomics does not exist here.
pub trait AtomicWord: Send + Sync {
    /// The plain integer type stored in the word.
    type Value: Copy + Eq;

    /// Adds one, wrapping on overflow.
    fn increment(&self);

    /// Subtracts one, wrapping on underflow.
    fn decrement(&self);

    /// Stores `new` and returns the previous value.
    fn exchange(&self, new: Self::Value) -> Self::Value;

    /// Stores 1 if the word is 0.
    ///
    /// Returns `true` iff the word was 0 before the call, i.e. the caller
    /// acquired the flag.
    fn test_and_set(&self) -> bool;

    /// Reads the current value.
    fn value(&self) -> Self::Value;
}

macro_rules! impl_atomic_word {
    ($atomic:ty, $value:ty) => {
        impl AtomicWord for $atomic {
            type Value = $value;

            #[inline]
            fn increment(&self) {
                single_core_fence();
                self.fetch_add(1, CORE_SAFETY.sync_ordering());
                single_core_fence();
            }

            #[inline]
            fn decrement(&self) {
                single_core_fence();
                self.fetch_sub(1, CORE_SAFETY.sync_ordering());
                single_core_fence();
            }

            #[inline]
            fn exchange(&self, new: $value) -> $value {
                single_core_fence();
                let old = self.swap(new, CORE_SAFETY.sync_ordering());
                single_core_fence();
                old
            }

            #[inline]
            fn test_and_set(&self) -> bool {
                single_core_fence();
                let acquired = self
                    .compare_exchange(0, 1, CORE_SAFETY.sync_ordering(), Ordering::Relaxed)
                    .is_ok();
                single_core_fence();
                acquired
            }

            #[inline]
            fn value(&self) -> $value {
                self.load(CORE_SAFETY.sync_ordering())
            }
        }
    };
}

impl_atomic_word!(AtomicU8, u8);
impl_atomic_word!(AtomicU16, u16);
impl_atomic_word!(AtomicU32, u32);
