use crate::error::PoolError;
use crossbeam_utils::{Backoff, CachePadded};
use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Lock-free bump allocator over up to 64 lazily allocated chunks.
///
/// Allocations are never freed individually; [`reset`](Self::reset) rewinds
/// every chunk at once and `Drop` returns the memory to the system. Values
/// placed in the arena are never dropped, which is why
/// [`alloc_value`](Self::alloc_value) only accepts `Copy` types.
pub struct LfLinearAllocator {
    chunks: Box<[AtomicPtr<u8>]>,
    offsets: Box<[CachePadded<AtomicUsize>]>,

    // Bit i set while a thread allocates the backing memory of chunk i.
    locked_for_alloc: AtomicU64,

    chunk_layout: Layout,
}

unsafe impl Send for LfLinearAllocator {}
unsafe impl Sync for LfLinearAllocator {}

impl LfLinearAllocator {
    pub fn new(chunk_size: usize, align: usize, max_chunks: usize) -> Result<Self, PoolError> {
        if max_chunks == 0 || max_chunks > u64::BITS as usize {
            return Err(PoolError::InvalidShape(format!(
                "max_chunks must be in 1..=64, got {max_chunks}"
            )));
        }

        let chunk_layout = Layout::from_size_align(chunk_size, align)
            .map_err(|e| PoolError::InvalidShape(format!("chunk layout: {e}")))?;

        if chunk_size == 0 {
            return Err(PoolError::InvalidShape("chunk_size must not be 0".into()));
        }

        Ok(Self {
            chunks: (0..max_chunks).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            offsets: (0..max_chunks)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
            locked_for_alloc: AtomicU64::new(0),
            chunk_layout,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_layout.size()
    }

    /// Carves `layout` out of the first chunk with room for it.
    ///
    /// Returns `None` for layouts larger than a chunk or more aligned than
    /// the chunk base, and once every chunk is used up.
    pub fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() > self.chunk_layout.size() || layout.align() > self.chunk_layout.align() {
            return None;
        }

        (0..self.chunks.len()).find_map(|i| {
            let base = self.chunk_base(i)?;
            self.bump(i, base, layout)
        })
    }

    /// Copies `value` into the arena.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_value<T: Copy>(&self, value: T) -> Option<&mut T> {
        let ptr = self.alloc(Layout::new::<T>())?.cast::<T>();

        // Safety: the range is freshly carved, properly aligned and never
        // handed out again before `reset`, which needs `&mut self`.
        unsafe {
            ptr.as_ptr().write(value);
            Some(&mut *ptr.as_ptr())
        }
    }

    /// Bytes handed out so far, including alignment padding.
    pub fn used_bytes(&self) -> usize {
        self.offsets.iter().map(|o| o.load(Ordering::Relaxed)).sum()
    }

    /// Rewinds every chunk, keeping the memory for reuse.
    pub fn reset(&mut self) {
        self.offsets.iter_mut().for_each(|o| *o.get_mut() = 0);
    }

    fn chunk_base(&self, i: usize) -> Option<*mut u8> {
        let current = self.chunks[i].load(Ordering::Acquire);
        if !current.is_null() {
            return Some(current);
        }

        let bit = 1u64 << i;
        let backoff = Backoff::new();

        loop {
            if self.locked_for_alloc.fetch_or(bit, Ordering::Acquire) & bit == 0 {
                // Somebody may have finished between our load and the lock.
                let mut base = self.chunks[i].load(Ordering::Acquire);

                if base.is_null() {
                    // Safety: layout has a non-zero size, checked in `new`.
                    base = unsafe { alloc::alloc(self.chunk_layout) };
                    self.chunks[i].store(base, Ordering::Release);
                }

                self.locked_for_alloc.fetch_and(!bit, Ordering::Release);
                return (!base.is_null()).then_some(base);
            }

            backoff.snooze();

            let base = self.chunks[i].load(Ordering::Acquire);
            if !base.is_null() {
                return Some(base);
            }
        }
    }

    fn bump(&self, i: usize, base: *mut u8, layout: Layout) -> Option<NonNull<u8>> {
        let offset = &self.offsets[i];
        let mut current = offset.load(Ordering::Relaxed);

        loop {
            let start = current.checked_next_multiple_of(layout.align())?;
            let end = start.checked_add(layout.size())?;

            if end > self.chunk_layout.size() {
                return None;
            }

            match offset.compare_exchange_weak(current, end, Ordering::Relaxed, Ordering::Relaxed) {
                // Safety: start < chunk size.
                Ok(_) => return NonNull::new(unsafe { base.add(start) }),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for LfLinearAllocator {
    fn drop(&mut self) {
        for chunk in self.chunks.iter_mut() {
            let base = std::mem::replace(chunk.get_mut(), ptr::null_mut());
            if !base.is_null() {
                // Safety: allocated in `chunk_base` with `chunk_layout`.
                unsafe { alloc::dealloc(base, self.chunk_layout) };
            }
        }
    }
}

impl fmt::Debug for LfLinearAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LfLinearAllocator")
            .field("chunk_size", &self.chunk_layout.size())
            .field("max_chunks", &self.chunks.len())
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}
