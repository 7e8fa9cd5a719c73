use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a task.
///
/// Discriminants are ordered: every live state sorts below every finished
/// state, and the interrupted states (`Canceled`, `Failed`) sort last, so the
/// classification helpers are single comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskStatus {
    /// Created, not yet enqueued.
    Initial = 0,

    /// Enqueued, waiting for its dependencies or a thread.
    Pending = 1,

    /// Claimed by a thread, `run` is executing.
    InProgress = 2,

    /// Cancel requested, `on_cancel` still has to run.
    Cancellation = 3,

    /// `run` asked to be called again once new dependencies clear.
    Continue = 4,

    Completed = 16,

    Canceled = 32,

    Failed = 33,
}

const FINISHED: u8 = TaskStatus::Completed as u8;
const INTERRUPTED: u8 = TaskStatus::Canceled as u8;

impl TaskStatus {
    /// Completed, Canceled or Failed.
    #[inline]
    pub fn is_finished(self) -> bool {
        self as u8 >= FINISHED
    }

    /// Canceled or Failed.
    #[inline]
    pub fn is_interrupted(self) -> bool {
        self as u8 >= INTERRUPTED
    }

    fn from_u8(val: u8) -> TaskStatus {
        match val {
            0 => TaskStatus::Initial,
            1 => TaskStatus::Pending,
            2 => TaskStatus::InProgress,
            3 => TaskStatus::Cancellation,
            4 => TaskStatus::Continue,
            16 => TaskStatus::Completed,
            32 => TaskStatus::Canceled,
            33 => TaskStatus::Failed,
            _ => unreachable!("corrupted task status: {val}"),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Atomic cell holding a [`TaskStatus`].
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub(crate) const fn new(status: TaskStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> TaskStatus {
        TaskStatus::from_u8(self.0.load(order))
    }

    #[inline]
    pub(crate) fn store(&self, status: TaskStatus, order: Ordering) {
        self.0.store(status as u8, order);
    }

    /// Single-shot CAS. Returns the observed status on failure.
    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<(), TaskStatus> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaskStatus::from_u8)
    }

    /// CAS loop moving to `to` from any status accepted by `allowed`.
    ///
    /// Returns the status we moved away from, or the first observed status
    /// that `allowed` rejected. A lost race re-reads the status and decides
    /// again, it never retries blindly.
    pub(crate) fn transition<F>(&self, allowed: F, to: TaskStatus) -> Result<TaskStatus, TaskStatus>
    where
        F: Fn(TaskStatus) -> bool,
    {
        let mut current = self.load(Ordering::Acquire);

        loop {
            if !allowed(current) {
                return Err(current);
            }

            match self.0.compare_exchange_weak(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = TaskStatus::from_u8(actual),
            }
        }
    }
}

impl fmt::Debug for AtomicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}
