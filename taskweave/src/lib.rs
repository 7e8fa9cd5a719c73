//! Dependency-graph task scheduler.
//!
//! Tasks declare what they wait on (other tasks, interlocks, custom
//! dependencies resolved by pluggable managers) and are queued right away in
//! the sharded queue of their thread type. Threads pull the first task whose
//! wait mask is empty. Predecessors notify their dependents through output
//! lists carved out of lock-free bit-hierarchy pools.

pub mod deps;

mod error;
pub use error::{PoolError, SchedulerError};

pub mod pool;

mod promise;
pub use promise::{Promise, PromiseState};

pub mod runtime;
pub use runtime::{Builder, Runtime};

mod scheduler;
pub use scheduler::{QueueStats, Scheduler};

pub mod task;
pub use task::{AsyncTask, Run, TaskContext, TaskStatus, ThreadType};

pub mod thread;

mod utils;

#[cfg(test)]
mod test_utils;
