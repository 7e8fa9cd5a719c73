use crate::error::PoolError;
use crate::pool::bits::{FULL, GROUP_BITS, claim_bit, first_free, unused_bits};
use crate::utils::SpinLock;
use crossbeam_utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Maximum number of chunks, one bit each in the top-level word.
pub const MAX_CHUNKS: usize = u64::BITS as usize;

/// Maximum slots per chunk: 64 groups of 64 slots.
pub const MAX_CHUNK_SIZE: usize = GROUP_BITS * GROUP_BITS;

/// Passes over the top and high levels before reporting failure. A pass only
/// fails when concurrent assignments raced us to every free bit we saw.
const WAIT_COUNT: usize = 8;

type Slot<T> = UnsafeCell<MaybeUninit<T>>;

struct Chunk<T> {
    // Serializes the rare full <-> not-full transitions of a group so the high
    // and top levels cannot lose an update.
    guard: SpinLock<()>,

    // Bit g set when group g is full.
    high: AtomicU64,

    // Bit b of word g set when slot `g * 64 + b` is assigned.
    low: Box<[CachePadded<AtomicU64>]>,

    // Bit b of word g set once the slot payload has been constructed.
    created: Box<[AtomicU64]>,

    // Lazily allocated `chunk_size` slots.
    data: AtomicPtr<Slot<T>>,
}

/// Lock-free pool of `T` addressed by `u32` indices.
///
/// Storage is split in up to [`MAX_CHUNKS`] chunks, each allocated on first
/// touch. A three-level bitmap locates free slots: one top bit per chunk, one
/// high bit per group of 64 slots and one low bit per slot. Slots keep their
/// payload after [`unassign`](Self::unassign), the constructor passed to
/// [`assign_with`](Self::assign_with) only runs the first time a slot is used.
pub struct LfIndexedPool<T> {
    top: CachePadded<AtomicU64>,
    chunks: Box<[Chunk<T>]>,

    chunk_size: usize,
    groups_per_chunk: usize,

    low_init: u64,
    high_init: u64,
    top_init: u64,
}

// Safety: slots are only handed out by index; the pool itself moves `T` values
// between threads (construction and drop), which requires `T: Send`. Shared
// access through `get` additionally requires `T: Sync`.
unsafe impl<T: Send> Send for LfIndexedPool<T> {}
unsafe impl<T: Send + Sync> Sync for LfIndexedPool<T> {}

impl<T> LfIndexedPool<T> {
    /// Creates a pool of `max_chunks` chunks of `chunk_size` slots.
    ///
    /// `chunk_size` must be a power of two no larger than [`MAX_CHUNK_SIZE`]
    /// and `max_chunks` must be in `1..=MAX_CHUNKS`.
    pub fn new(chunk_size: usize, max_chunks: usize) -> Result<Self, PoolError> {
        if !chunk_size.is_power_of_two() || chunk_size > MAX_CHUNK_SIZE {
            return Err(PoolError::InvalidShape(format!(
                "chunk_size must be a power of two <= {MAX_CHUNK_SIZE}, got {chunk_size}"
            )));
        }

        if max_chunks == 0 || max_chunks > MAX_CHUNKS {
            return Err(PoolError::InvalidShape(format!(
                "max_chunks must be in 1..={MAX_CHUNKS}, got {max_chunks}"
            )));
        }

        let groups_per_chunk = chunk_size.div_ceil(GROUP_BITS);
        let low_init = unused_bits(chunk_size.min(GROUP_BITS));
        let high_init = unused_bits(groups_per_chunk);
        let top_init = unused_bits(max_chunks);

        let chunks = (0..max_chunks)
            .map(|_| Chunk {
                guard: SpinLock::new(()),
                high: AtomicU64::new(high_init),
                low: (0..groups_per_chunk)
                    .map(|_| CachePadded::new(AtomicU64::new(low_init)))
                    .collect(),
                created: (0..groups_per_chunk).map(|_| AtomicU64::new(0)).collect(),
                data: AtomicPtr::new(ptr::null_mut()),
            })
            .collect();

        Ok(Self {
            top: CachePadded::new(AtomicU64::new(top_init)),
            chunks,
            chunk_size,
            groups_per_chunk,
            low_init,
            high_init,
            top_init,
        })
    }

    pub fn capacity(&self) -> usize {
        self.chunk_size * self.chunks.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Claims a free slot, constructing its payload with `ctor` if the slot
    /// has never been used before.
    pub fn assign_with<F>(&self, ctor: F) -> Result<u32, PoolError>
    where
        F: FnOnce() -> T,
    {
        let index = self.claim()?;
        let (chunk_idx, group, bit) = self.decompose(index);
        let chunk = &self.chunks[chunk_idx];
        let mask = 1u64 << bit;

        // The low-level claim already ordered us after the previous owner's
        // release, so the created bit itself only needs atomicity.
        if chunk.created[group].fetch_or(mask, Ordering::Relaxed) & mask == 0 {
            let slot = self.slot_ptr(chunk_idx, index);

            // Safety: we own the slot exclusively until it is unassigned and
            // it has never been initialized.
            unsafe { (*slot).get().write(MaybeUninit::new(ctor())) };
        }

        Ok(index)
    }

    /// Returns the slot to the pool. Returns false if it was not assigned.
    pub fn unassign(&self, index: u32) -> bool {
        let Some((chunk_idx, group, bit)) = self.checked_decompose(index) else {
            return false;
        };

        let chunk = &self.chunks[chunk_idx];
        let mask = 1u64 << bit;
        let old = chunk.low[group].fetch_and(!mask, Ordering::Release);

        if old & mask == 0 {
            return false;
        }

        if old == FULL {
            self.sync_group(chunk_idx, group);
        }

        true
    }

    pub fn is_assigned(&self, index: u32) -> bool {
        self.checked_decompose(index)
            .map(|(chunk_idx, group, bit)| {
                self.chunks[chunk_idx].low[group].load(Ordering::Relaxed) & (1u64 << bit) != 0
            })
            .unwrap_or(false)
    }

    /// Shared access to an assigned slot.
    pub fn get(&self, index: u32) -> Option<&T> {
        let (chunk_idx, group, bit) = self.checked_decompose(index)?;
        let chunk = &self.chunks[chunk_idx];
        let mask = 1u64 << bit;

        if chunk.low[group].load(Ordering::Acquire) & mask == 0
            || chunk.created[group].load(Ordering::Relaxed) & mask == 0
        {
            return None;
        }

        // Safety: the slot is assigned and initialized, mutable access is only
        // handed out through the unsafe `get_unchecked_mut`.
        Some(unsafe { (*(*self.slot_ptr(chunk_idx, index)).get()).assume_init_ref() })
    }

    /// Exclusive access to an assigned slot.
    ///
    /// # Safety
    ///
    /// `index` must have been returned by `assign_with` and not unassigned
    /// since, and the caller must guarantee no other reference to this slot
    /// is alive for the duration of the borrow.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_unchecked_mut(&self, index: u32) -> &mut T {
        let (chunk_idx, _, _) = self.decompose(index);
        debug_assert!(self.is_assigned(index), "slot {index} is not assigned");

        // Safety: forwarded to the caller.
        unsafe { (*(*self.slot_ptr(chunk_idx, index)).get()).assume_init_mut() }
    }

    /// Number of slots currently assigned. Only exact when quiescent.
    pub fn assigned_count(&self) -> usize {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.low.iter())
            .map(|word| (word.load(Ordering::Relaxed) & !self.low_init).count_ones() as usize)
            .sum()
    }

    /// Drops every constructed payload and frees all chunk storage, leaving
    /// the pool empty and reusable.
    pub fn release(&mut self) {
        let chunk_size = self.chunk_size;

        for chunk in self.chunks.iter_mut() {
            let data = *chunk.data.get_mut();

            if !data.is_null() {
                for (group, created) in chunk.created.iter_mut().enumerate() {
                    let mut bits = *created.get_mut();

                    while let Some(bit) = first_free(!bits) {
                        bits &= !(1u64 << bit);
                        let offset = group * GROUP_BITS + bit as usize;

                        // Safety: created bit set means the slot was initialized
                        // and `&mut self` excludes every other accessor.
                        unsafe { (*(*data.add(offset)).get()).assume_init_drop() };
                    }
                }

                // Safety: allocated in `ensure_chunk` with exactly `chunk_size` slots.
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(data, chunk_size)) });
                *chunk.data.get_mut() = ptr::null_mut();
            }

            *chunk.high.get_mut() = self.high_init;
            chunk.low.iter_mut().for_each(|w| *w.get_mut() = self.low_init);
            chunk.created.iter_mut().for_each(|w| *w.get_mut() = 0);
        }

        *self.top.get_mut() = self.top_init;
    }
}

// --- Private methods ---
impl<T> LfIndexedPool<T> {
    fn claim(&self) -> Result<u32, PoolError> {
        let backoff = Backoff::new();

        for _ in 0..WAIT_COUNT {
            let mut top = self.top.load(Ordering::Acquire);

            if top == FULL {
                return Err(PoolError::Exhausted);
            }

            while let Some(chunk_idx) = first_free(top) {
                if let Some(index) = self.claim_in_chunk(chunk_idx as usize) {
                    return Ok(index);
                }

                // Skip this chunk for the rest of the pass.
                top |= 1u64 << chunk_idx;
            }

            backoff.snooze();
        }

        Err(PoolError::Exhausted)
    }

    fn claim_in_chunk(&self, chunk_idx: usize) -> Option<u32> {
        let chunk = &self.chunks[chunk_idx];
        self.ensure_chunk(chunk);

        for _ in 0..WAIT_COUNT {
            let mut high = chunk.high.load(Ordering::Acquire);

            if high == FULL {
                return None;
            }

            while let Some(group) = first_free(high) {
                let group = group as usize;

                if let Some((bit, now)) = claim_bit(&chunk.low[group]) {
                    if now == FULL {
                        self.sync_group(chunk_idx, group);
                    }

                    let index = chunk_idx * self.chunk_size + group * GROUP_BITS + bit as usize;
                    return Some(index as u32);
                }

                high |= 1u64 << group;
            }
        }

        None
    }

    /// Recomputes the cached high and top bits for `group` from the low level.
    ///
    /// Both assign (not-full -> full) and unassign (full -> not-full) end up
    /// here and re-read the low word under the chunk guard, so whichever
    /// thread runs last publishes the current truth.
    fn sync_group(&self, chunk_idx: usize, group: usize) {
        let chunk = &self.chunks[chunk_idx];
        let _guard = chunk.guard.lock();

        let group_mask = 1u64 << group;
        let chunk_mask = 1u64 << chunk_idx;

        if chunk.low[group].load(Ordering::Acquire) == FULL {
            let high = chunk.high.fetch_or(group_mask, Ordering::AcqRel) | group_mask;
            if high == FULL {
                self.top.fetch_or(chunk_mask, Ordering::AcqRel);
            }
        } else {
            let high = chunk.high.fetch_and(!group_mask, Ordering::AcqRel);
            if high == FULL {
                self.top.fetch_and(!chunk_mask, Ordering::AcqRel);
            }
        }
    }

    fn ensure_chunk(&self, chunk: &Chunk<T>) -> *mut Slot<T> {
        let current = chunk.data.load(Ordering::Acquire);
        if !current.is_null() {
            return current;
        }

        let fresh: Box<[Slot<T>]> = (0..self.chunk_size)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        let fresh = Box::into_raw(fresh) as *mut Slot<T>;

        match chunk.data.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(winner) => {
                // Lost the race, adopt the winner's storage.
                // Safety: `fresh` was never published.
                drop(unsafe {
                    Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, self.chunk_size))
                });
                winner
            }
        }
    }

    fn slot_ptr(&self, chunk_idx: usize, index: u32) -> *const Slot<T> {
        let data = self.chunks[chunk_idx].data.load(Ordering::Acquire);
        debug_assert!(!data.is_null());

        // Safety: offset < chunk_size by construction of the index.
        unsafe { data.add(index as usize % self.chunk_size) }
    }

    #[inline]
    fn decompose(&self, index: u32) -> (usize, usize, u32) {
        let index = index as usize;
        let chunk_idx = index / self.chunk_size;
        let offset = index % self.chunk_size;

        (chunk_idx, offset / GROUP_BITS, (offset % GROUP_BITS) as u32)
    }

    #[inline]
    fn checked_decompose(&self, index: u32) -> Option<(usize, usize, u32)> {
        ((index as usize) < self.capacity()).then(|| self.decompose(index))
    }
}

impl<T> Drop for LfIndexedPool<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> fmt::Debug for LfIndexedPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LfIndexedPool")
            .field("chunk_size", &self.chunk_size)
            .field("max_chunks", &self.chunks.len())
            .field("groups_per_chunk", &self.groups_per_chunk)
            .field("assigned", &self.assigned_count())
            .finish()
    }
}

#[cfg(test)]
impl<T> LfIndexedPool<T> {
    /// Checks the high and top levels match the low level. Quiescent only.
    pub(crate) fn hierarchy_is_consistent(&self) -> bool {
        self.chunks.iter().enumerate().all(|(chunk_idx, chunk)| {
            let high = chunk.high.load(Ordering::Relaxed);

            let groups_ok = chunk.low.iter().enumerate().all(|(group, low)| {
                let full = low.load(Ordering::Relaxed) == FULL;
                full == (high & (1u64 << group) != 0)
            });

            let chunk_full = high == FULL;
            let top_bit = self.top.load(Ordering::Relaxed) & (1u64 << chunk_idx) != 0;

            groups_ok && chunk_full == top_bit
        })
    }
}
