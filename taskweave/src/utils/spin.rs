use crossbeam_utils::Backoff;
use parking_lot::lock_api;
use std::sync::atomic::{AtomicBool, Ordering};

/// Test-and-test-and-set spinlock used for the short critical sections of the
/// scheduler: shard task lists, task output lists and pool cascades.
///
/// Exposed through `lock_api` so guards behave like `parking_lot` guards.
pub(crate) struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: RawSpinLock = RawSpinLock {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        let backoff = Backoff::new();

        while !self.try_lock() {
            // Spin on a plain load so the cache line stays shared while held.
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub(crate) type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;
