use crate::error::SchedulerError;
use crate::task::deps::Interlock;
use crate::task::output::OutputList;
use crate::task::status::AtomicStatus;
use crate::task::{Run, TaskId, TaskStatus, ThreadType};
use crate::utils::SpinLock;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::warn;

/// Width of the wait mask, the maximum number of dependencies per episode.
pub const MAX_DEPENDENCIES: usize = u64::BITS as usize;

/// Shared state of a task. Owned through [`AsyncTask`] handles.
pub(crate) struct TaskCore {
    pub(crate) id: TaskId,
    pub(crate) name: Cow<'static, str>,
    pub(crate) thread_type: ThreadType,

    pub(crate) status: AtomicStatus,

    /// One bit per registered dependency, 1 while still waiting.
    pub(crate) wait_bits: AtomicU64,

    /// Strong dependencies which ended canceled.
    pub(crate) canceled_deps: AtomicU32,

    /// Who waits on me.
    pub(crate) output: SpinLock<OutputList>,

    pub(crate) interlock: SpinLock<Option<Arc<dyn Interlock>>>,

    // Only ever locked by the single thread that won the task, so never
    // contended. The lock is what makes `Run: Send` sufficient.
    pub(crate) body: Mutex<Box<dyn Run>>,
}

impl TaskCore {
    /// Ready to be pulled: every bit cleared, or doomed to cancellation.
    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        self.wait_bits.load(Ordering::Acquire) == 0 || self.must_cancel()
    }

    #[inline]
    pub(crate) fn must_cancel(&self) -> bool {
        self.canceled_deps.load(Ordering::Acquire) > 0
            || self.status.load(Ordering::Acquire) == TaskStatus::Cancellation
    }

    /// Clears the wait bit of a resolved dependency.
    ///
    /// The counter is bumped first so whoever observes the cleared bit also
    /// observes the cancellation.
    pub(crate) fn complete_dependency(&self, bit: u32, canceled: bool) {
        debug_assert!((bit as usize) < MAX_DEPENDENCIES);

        if canceled {
            self.canceled_deps.fetch_add(1, Ordering::Relaxed);
        }
        self.wait_bits.fetch_and(!(1u64 << bit), Ordering::Release);
    }
}

impl Drop for TaskCore {
    fn drop(&mut self) {
        let output = self.output.get_mut();

        if !output.is_empty() {
            // Never enqueued, or the scheduler went away before running it.
            // Dependents can no longer be satisfied by this task.
            let released = output.release(true);
            warn!(
                task.id = %self.id,
                task.name = %self.name,
                released,
                "task dropped with registered dependents, canceling them"
            );
        }
    }
}

/// Reference-counted handle to a schedulable unit of work.
///
/// Cloning is cheap. The task is destroyed when the last handle is dropped,
/// handles held by the scheduler included.
#[derive(Clone)]
pub struct AsyncTask(pub(crate) Arc<TaskCore>);

impl AsyncTask {
    /// Wraps `body` in a new task in the `Initial` state.
    pub fn new<R: Run>(body: R) -> Self {
        Self::from_boxed(Box::new(body))
    }

    pub fn from_boxed(body: Box<dyn Run>) -> Self {
        AsyncTask(Arc::new(TaskCore {
            id: TaskId::next(),
            name: body.name(),
            thread_type: body.thread_type(),
            status: AtomicStatus::new(TaskStatus::Initial),
            wait_bits: AtomicU64::new(u64::MAX),
            canceled_deps: AtomicU32::new(0),
            output: SpinLock::new(OutputList::default()),
            interlock: SpinLock::new(None),
            body: Mutex::new(body),
        }))
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn thread_type(&self) -> ThreadType {
        self.0.thread_type
    }

    pub fn status(&self) -> TaskStatus {
        self.0.status.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    pub fn is_interrupted(&self) -> bool {
        self.status().is_interrupted()
    }

    /// Current wait mask, mostly useful for diagnostics.
    pub fn wait_bits(&self) -> u64 {
        self.0.wait_bits.load(Ordering::Acquire)
    }

    pub fn canceled_deps_count(&self) -> u32 {
        self.0.canceled_deps.load(Ordering::Acquire)
    }

    /// True once a puller would accept the task.
    pub fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    /// Re-arms a finished task so it can be enqueued again.
    ///
    /// Only valid from `Completed`, `Canceled` or `Failed`, and once every
    /// dependency of the last episode resolved: a task canceled or failed
    /// while still waiting keeps edges on its predecessors until they finish.
    /// Dependents which were registered while the task was live have already
    /// been notified.
    pub fn reset_for_reuse(&self) -> Result<(), SchedulerError> {
        let core = &self.0;

        // Hold the output lock so nobody records an edge mid-reset.
        let output = core.output.lock();
        debug_assert!(output.is_empty(), "finished task still owns output chunks");

        let status = core.status.load(Ordering::Acquire);
        if !status.is_finished() {
            return Err(SchedulerError::InvalidState {
                expected: "a finished task",
                found: status,
            });
        }

        // Only registration sets bits, and a finished task registers nothing.
        let remaining = core.wait_bits.load(Ordering::Acquire).count_ones();
        if remaining > 0 {
            return Err(SchedulerError::UnresolvedDependencies { remaining });
        }

        core.status
            .transition(TaskStatus::is_finished, TaskStatus::Initial)
            .map_err(|found| SchedulerError::InvalidState {
                expected: "a finished task",
                found,
            })?;

        core.wait_bits.store(u64::MAX, Ordering::Relaxed);
        core.canceled_deps.store(0, Ordering::Relaxed);
        *core.interlock.lock() = None;
        drop(output);

        Ok(())
    }

    pub fn ptr_eq(&self, other: &AsyncTask) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for AsyncTask {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for AsyncTask {}

impl Hash for AsyncTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("thread_type", &self.0.thread_type)
            .field("status", &self.0.status)
            .field("wait_bits", &format_args!("{:#x}", self.wait_bits()))
            .field("canceled_deps", &self.canceled_deps_count())
            .finish()
    }
}
