use crate::error::PoolError;
use crate::pool::bits::{GROUP_BITS, claim_bit, first_free, take_bit, unused_bits};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Upper bound on the capacity, 64 words of 64 slots.
pub const MAX_STATIC_CAPACITY: usize = GROUP_BITS * GROUP_BITS;

/// Rounds over the bitmaps before giving up, with a yield between rounds.
const WAIT_COUNT: usize = 10;

/// Fixed-capacity, lock-free bag of `T`.
///
/// Each slot is tracked by two bits. `taken` is claimed by a writer before it
/// writes a value and released by the reader that moved it out; `ready` is set
/// by the writer once the value is visible and claimed by a reader. `put` and
/// `extract` are safe to race with each other, [`clear`](Self::clear) takes
/// `&mut self` and therefore excludes both.
pub struct LfStaticPool<T> {
    taken: Box<[AtomicU64]>,
    ready: Box<[AtomicU64]>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: usize,
}

unsafe impl<T: Send> Send for LfStaticPool<T> {}
unsafe impl<T: Send> Sync for LfStaticPool<T> {}

impl<T> LfStaticPool<T> {
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 || capacity > MAX_STATIC_CAPACITY {
            return Err(PoolError::InvalidShape(format!(
                "static pool capacity must be in 1..={MAX_STATIC_CAPACITY}, got {capacity}"
            )));
        }

        let words = capacity.div_ceil(GROUP_BITS);

        let taken = (0..words)
            .map(|w| AtomicU64::new(Self::taken_init(capacity, w)))
            .collect();
        let ready = (0..words).map(|_| AtomicU64::new(0)).collect();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Ok(Self {
            taken,
            ready,
            slots,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of values ready to be extracted. Only exact when quiescent.
    pub fn len(&self) -> usize {
        self.ready
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `value`, handing it back if every slot stayed taken.
    pub fn put(&self, value: T) -> Result<(), T> {
        for round in 0..WAIT_COUNT {
            for (w, word) in self.taken.iter().enumerate() {
                let Some((bit, _)) = claim_bit(word) else {
                    continue;
                };

                let index = w * GROUP_BITS + bit as usize;

                // Safety: the taken bit gives us exclusive access to the slot.
                unsafe { (*self.slots[index].get()).write(value) };

                self.ready[w].fetch_or(1u64 << bit, Ordering::Release);
                return Ok(());
            }

            if round + 1 < WAIT_COUNT {
                thread::yield_now();
            }
        }

        Err(value)
    }

    /// Moves one value out of the pool.
    pub fn extract(&self) -> Option<T> {
        for round in 0..WAIT_COUNT {
            for (w, word) in self.ready.iter().enumerate() {
                let Some(bit) = take_bit(word) else {
                    continue;
                };

                let index = w * GROUP_BITS + bit as usize;

                // Safety: the ready bit was published after the write, and
                // clearing it gave us exclusive ownership of the value.
                let value = unsafe { (*self.slots[index].get()).assume_init_read() };

                self.taken[w].fetch_and(!(1u64 << bit), Ordering::Release);
                return Some(value);
            }

            if round + 1 < WAIT_COUNT {
                thread::yield_now();
            }
        }

        None
    }

    /// Drops every stored value.
    pub fn clear(&mut self) {
        self.clear_with(drop);
    }

    /// Moves every stored value into `f`.
    pub fn clear_with<F: FnMut(T)>(&mut self, mut f: F) {
        let capacity = self.capacity;

        for (w, word) in self.ready.iter_mut().enumerate() {
            let mut bits = std::mem::take(word.get_mut());

            while let Some(bit) = first_free(!bits) {
                bits &= !(1u64 << bit);
                let index = w * GROUP_BITS + bit as usize;

                // Safety: `&mut self` excludes writers and readers, a ready bit
                // means the slot holds an initialized value.
                f(unsafe { self.slots[index].get_mut().assume_init_read() });
            }

            *self.taken[w].get_mut() = Self::taken_init(capacity, w);
        }
    }

    // Bits past `capacity` in the last word are permanently taken.
    fn taken_init(capacity: usize, word: usize) -> u64 {
        let start = word * GROUP_BITS;
        unused_bits(capacity.saturating_sub(start))
    }
}

impl<T> Drop for LfStaticPool<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T> fmt::Debug for LfStaticPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LfStaticPool")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
