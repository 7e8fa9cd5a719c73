//! Bit-hierarchy primitives shared by the lock-free pools.
//!
//! Every level of the hierarchy is a plain `AtomicU64` where a set bit means
//! "taken" (a low-level slot is occupied, or a whole group/chunk is full).
//! Bits which do not map to a real slot are preset to 1 so a full word can
//! always be detected with a single comparison against [`FULL`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of slots tracked by one low-level word.
pub(crate) const GROUP_BITS: usize = u64::BITS as usize;

pub(crate) const FULL: u64 = u64::MAX;

/// Returns the index of the lowest zero bit in `word`.
#[inline]
pub(crate) fn first_free(word: u64) -> Option<u32> {
    let idx = (!word).trailing_zeros();
    (idx < u64::BITS).then_some(idx)
}

/// Mask with the `n` lowest bits set.
#[inline]
pub(crate) const fn low_mask(n: usize) -> u64 {
    if n >= GROUP_BITS {
        FULL
    } else {
        (1u64 << n) - 1
    }
}

/// Word with every bit at or above `n` preset, marking nonexistent slots as
/// permanently taken.
#[inline]
pub(crate) const fn unused_bits(n: usize) -> u64 {
    !low_mask(n)
}

/// Claims one zero bit of `word`, returning its index and the value written.
///
/// A CAS only fails when another thread changed the word, so the loop makes
/// system-wide progress and terminates as soon as the word is observed full.
#[inline]
pub(crate) fn claim_bit(word: &AtomicU64) -> Option<(u32, u64)> {
    let mut current = word.load(Ordering::Relaxed);

    loop {
        let bit = first_free(current)?;
        let next = current | (1u64 << bit);

        match word.compare_exchange_weak(current, next, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return Some((bit, next)),
            Err(actual) => current = actual,
        }
    }
}

/// Clears one set bit of `word`, returning its index. The mirror of
/// [`claim_bit`] for bitmaps where 1 means "ready to be taken".
#[inline]
pub(crate) fn take_bit(word: &AtomicU64) -> Option<u32> {
    let mut current = word.load(Ordering::Relaxed);

    loop {
        let bit = first_free(!current)?;
        let next = current & !(1u64 << bit);

        match word.compare_exchange_weak(current, next, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return Some(bit),
            Err(actual) => current = actual,
        }
    }
}
