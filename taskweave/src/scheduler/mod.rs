//! The scheduler handle: per-thread-type sharded queues, dependency
//! registration and the task execution protocol.
//!
//! A task is pushed to the queue of its thread type as soon as it is
//! enqueued, whatever the state of its dependencies. Pullers skip tasks whose
//! wait mask is not empty, so a dependency completing never has to touch a
//! queue: it only clears a bit.

use crate::deps::{DependencyManager, ManagerRegistry};
use crate::error::SchedulerError;
use crate::runtime::RuntimeConfig;
use crate::task::output::OutputPool;
use crate::task::{AsyncTask, Run, ThreadType};
use crate::thread::Thread;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

mod enqueue;
mod process;

mod queue;
pub use queue::QueueStats;
pub(crate) use queue::{Pulled, TaskQueue};

#[cfg(test)]
mod tests;

/// Spins before `wait` starts sleeping between checks.
const WAIT_SPIN_COUNT: u32 = 2_000;

const WAIT_SLEEP: Duration = Duration::from_micros(50);

pub(crate) struct Shared {
    queues: Box<[TaskQueue]>,

    /// Backs the output lists of every task enqueued here.
    pub(crate) output_pool: Arc<OutputPool>,

    pub(crate) managers: ManagerRegistry,

    threads: Mutex<Vec<Arc<dyn Thread>>>,

    next_thread_uid: AtomicU32,

    shutdown: AtomicBool,

    wait_timeout: Duration,
}

impl Shared {
    pub(crate) fn threads_snapshot(&self) -> Vec<Arc<dyn Thread>> {
        self.threads.lock().clone()
    }
}

/// Cloneable handle to a scheduler. Every clone drives the same queues.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) shared: Arc<Shared>,
}

impl Scheduler {
    pub(crate) fn new(cfg: &RuntimeConfig) -> Result<Self, SchedulerError> {
        let queues = ThreadType::ALL
            .iter()
            .map(|&tt| TaskQueue::new(tt, cfg.shards[tt.index()]))
            .collect();

        let output_pool = OutputPool::new(cfg.output_chunk_size, cfg.output_max_chunks)?;

        Ok(Self {
            shared: Arc::new(Shared {
                queues,
                output_pool: Arc::new(output_pool),
                managers: ManagerRegistry::default(),
                threads: Mutex::new(Vec::new()),
                next_thread_uid: AtomicU32::new(0),
                shutdown: AtomicBool::new(false),
                wait_timeout: cfg.wait_timeout,
            }),
        })
    }

    #[inline]
    pub(crate) fn queue(&self, thread_type: ThreadType) -> &TaskQueue {
        &self.shared.queues[thread_type.index()]
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Creates a task from `body` and enqueues it behind `deps`.
    pub fn spawn<R, D>(&self, body: R, deps: D) -> Result<AsyncTask, SchedulerError>
    where
        R: Run,
        D: crate::task::IntoDeps,
    {
        let task = AsyncTask::new(body);
        self.enqueue(&task, deps)?;
        Ok(task)
    }

    /// Registers a manager for dependencies built from a `T`.
    ///
    /// Returns false, leaving the existing one in place, if a manager is
    /// already registered for `T`.
    pub fn register_dependency_manager<T: Any>(&self, manager: Arc<dyn DependencyManager>) -> bool {
        self.shared.managers.register::<T>(manager)
    }

    pub fn unregister_dependency_manager<T: Any>(&self) -> bool {
        self.shared.managers.unregister::<T>()
    }

    /// Attaches `thread`, which starts pulling tasks from this scheduler.
    pub fn add_thread(&self, thread: Arc<dyn Thread>) -> anyhow::Result<()> {
        if self.is_shutdown() {
            return Err(SchedulerError::Shutdown.into());
        }

        let uid = self.shared.next_thread_uid.fetch_add(1, Ordering::Relaxed);
        thread.attach(self.clone(), uid)?;

        debug!(thread.uid = uid, thread.name = thread.name(), "thread attached");
        self.shared.threads.lock().push(thread);

        Ok(())
    }

    /// Blocks until every task in `tasks` reached a finished state.
    ///
    /// Spins for a while, then sleeps between checks. This is a convenience
    /// for callers outside the scheduler: a task body must never call it.
    pub fn wait(&self, tasks: &[AsyncTask], timeout: Duration) -> Result<(), SchedulerError> {
        let deadline = Instant::now() + timeout;

        for task in tasks {
            let mut spins = 0;

            while !task.is_finished() {
                if spins < WAIT_SPIN_COUNT {
                    spins += 1;
                    std::hint::spin_loop();
                    continue;
                }

                if Instant::now() >= deadline {
                    warn!(task.id = %task.id(), task.name = task.name(), ?timeout, "wait timed out");
                    return Err(SchedulerError::Timeout(timeout));
                }

                std::thread::sleep(WAIT_SLEEP);
            }
        }

        Ok(())
    }

    /// [`wait`](Self::wait) with the timeout configured on the runtime.
    pub fn wait_all(&self, tasks: &[AsyncTask]) -> Result<(), SchedulerError> {
        self.wait(tasks, self.shared.wait_timeout)
    }

    pub fn queue_stats(&self, thread_type: ThreadType) -> QueueStats {
        self.queue(thread_type).stats()
    }

    /// Tasks currently sitting in the queue of `thread_type`.
    pub fn queued(&self, thread_type: ThreadType) -> usize {
        self.queue(thread_type).len()
    }

    /// Stops the scheduler.
    ///
    /// Attached threads are detached (and joined), tasks still queued are
    /// canceled so their dependents and `on_cancel` hooks run, and dependency
    /// managers are dropped. Further enqueues fail with
    /// [`SchedulerError::Shutdown`]. Calling it twice is a no-op.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let threads = std::mem::take(&mut *self.shared.threads.lock());
        let failed = threads
            .iter()
            .filter_map(|thread| thread.detach().err().map(|e| (thread.name().to_owned(), e)))
            .inspect(|(name, e)| warn!(thread.name = %name, error = %e, "thread failed to detach"))
            .count();

        // Callers driving a queue by hand may still requeue continuations.
        // Keep going until every queue stays empty.
        let mut canceled = 0;
        loop {
            let leftovers = self
                .shared
                .queues
                .iter()
                .flat_map(TaskQueue::drain)
                .collect::<Vec<_>>();

            if leftovers.is_empty() {
                break;
            }

            for task in &leftovers {
                self.cancel_queued(task);
            }
            canceled += leftovers.len();
        }

        self.shared.managers.clear();

        for queue in self.shared.queues.iter() {
            let stats = queue.stats();
            if stats.processed == 0 {
                continue;
            }

            info!(
                queue = %queue.thread_type(),
                shards = stats.shards,
                processed = stats.processed,
                contended = stats.contended,
                work_ms = stats.work.as_millis() as u64,
                stall_ratio = format_args!("{:.3}", stats.stall_ratio()),
                insert_us = stats.insert.as_micros() as u64,
                "queue stats"
            );
        }

        debug!(threads = threads.len(), canceled, "scheduler shut down");

        if failed == 0 {
            Ok(())
        } else {
            Err(anyhow!("{} thread(s) panicked", failed))
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("queues", &self.shared.queues)
            .field("threads", &self.shared.threads.lock().len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
