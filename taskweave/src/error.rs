use crate::task::TaskStatus;
use std::time::Duration;

/// Errors reported by the lock-free pools.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every chunk is full and the pool already holds its configured maximum
    /// number of chunks. Not retried internally.
    #[error("pool exhausted: no free slot within the configured chunk limit")]
    Exhausted,

    #[error("invalid pool shape: {0}")]
    InvalidShape(String),
}

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    /// Only produced by the synchronous `wait` helper.
    #[error("timed out after {0:?} while waiting for tasks")]
    Timeout(Duration),

    #[error("task declares {requested} dependencies, the wait mask holds at most {max}")]
    TooManyDependencies { requested: usize, max: usize },

    #[error("no dependency manager registered for `{0}`")]
    UnknownDependency(&'static str),

    #[error("invalid task state: expected {expected}, found {found:?}")]
    InvalidState {
        expected: &'static str,
        found: TaskStatus,
    },

    /// Some predecessor or manager may still clear a wait bit of the task.
    #[error("task still has {remaining} unresolved dependencies")]
    UnresolvedDependencies { remaining: u32 },

    #[error("interlock already declared for this task")]
    DuplicateInterlock,

    #[error("scheduler is shut down")]
    Shutdown,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SchedulerError {
    /// Returns true if the caller may try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::Timeout(_))
    }

    /// Programming errors which will fail identically on every retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::TooManyDependencies { .. }
                | SchedulerError::UnknownDependency(_)
                | SchedulerError::DuplicateInterlock
                | SchedulerError::Pool(PoolError::InvalidShape(_))
        )
    }
}

impl PartialEq for SchedulerError {
    fn eq(&self, other: &Self) -> bool {
        use SchedulerError::*;

        match (self, other) {
            (Timeout(a), Timeout(b)) => a == b,
            (
                TooManyDependencies {
                    requested: r1,
                    max: m1,
                },
                TooManyDependencies {
                    requested: r2,
                    max: m2,
                },
            ) => r1 == r2 && m1 == m2,
            (UnknownDependency(a), UnknownDependency(b)) => a == b,
            (
                InvalidState {
                    expected: e1,
                    found: f1,
                },
                InvalidState {
                    expected: e2,
                    found: f2,
                },
            ) => e1 == e2 && f1 == f2,
            (
                UnresolvedDependencies { remaining: a },
                UnresolvedDependencies { remaining: b },
            ) => a == b,
            (DuplicateInterlock, DuplicateInterlock) => true,
            (Shutdown, Shutdown) => true,
            (Pool(a), Pool(b)) => a == b,
            // anyhow::Error is not comparable, fallback to display string.
            (Other(a), Other(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}
