//! Value-producing tasks chained through strong and weak dependencies.

use crate::error::SchedulerError;
use crate::scheduler::Scheduler;
use crate::task::{AsyncTask, IntoDeps, Run, StrongDep, TaskContext, TaskStatus, ThreadType, WeakDep};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type Slot<T> = Arc<Mutex<Option<Result<T, String>>>>;

/// Observable outcome of a [`Promise`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromiseState<T> {
    Pending,
    Ready(T),
    Failed(String),
    Canceled,
}

/// Handle to the value a task will produce.
///
/// A promise failing does not cancel its continuations: [`then`](Self::then)
/// continuations see the failure and fail in turn, [`except`](Self::except)
/// ones get a chance to recover.
pub struct Promise<T> {
    scheduler: Scheduler,
    task: AsyncTask,
    slot: Slot<T>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            task: self.task.clone(),
            slot: self.slot.clone(),
        }
    }
}

struct PromiseBody<T, F> {
    func: Option<F>,
    slot: Slot<T>,
    thread_type: ThreadType,
}

impl<T, F> Run for PromiseBody<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    fn run(&mut self, cx: &mut TaskContext<'_>) {
        let Some(func) = self.func.take() else {
            return;
        };

        match func() {
            Ok(value) => *self.slot.lock() = Some(Ok(value)),
            Err(e) => {
                *self.slot.lock() = Some(Err(format!("{e:#}")));
                cx.fail();
            }
        }
    }

    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("promise")
    }

    fn thread_type(&self) -> ThreadType {
        self.thread_type
    }
}

impl Scheduler {
    /// Spawns `func` on `thread_type` once `deps` resolve, returning a
    /// promise of its value.
    pub fn promise<T, F, D>(
        &self,
        thread_type: ThreadType,
        func: F,
        deps: D,
    ) -> Result<Promise<T>, SchedulerError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        D: IntoDeps,
    {
        let slot: Slot<T> = Arc::new(Mutex::new(None));

        let task = self.spawn(
            PromiseBody {
                func: Some(func),
                slot: slot.clone(),
                thread_type,
            },
            deps,
        )?;

        Ok(Promise {
            scheduler: self.clone(),
            task,
            slot,
        })
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    pub fn task(&self) -> &AsyncTask {
        &self.task
    }

    /// Maps the value once available. Canceled with this promise, fails
    /// without calling `func` if this promise failed.
    pub fn then<U, F>(&self, thread_type: ThreadType, func: F) -> Result<Promise<U>, SchedulerError>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> anyhow::Result<U> + Send + 'static,
    {
        let parent = self.slot.clone();

        self.scheduler.promise(
            thread_type,
            move || match &*parent.lock() {
                Some(Ok(value)) => func(value),
                Some(Err(e)) => Err(anyhow!("parent promise failed: {e}")),
                None => Err(anyhow!("parent promise produced no value")),
            },
            StrongDep(self.task.clone()),
        )
    }

    /// Passes the value through, or falls back to `func` when this promise
    /// failed or was canceled.
    pub fn except<F>(&self, thread_type: ThreadType, func: F) -> Result<Promise<T>, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let parent = self.slot.clone();

        self.scheduler.promise(
            thread_type,
            move || {
                let value = match &*parent.lock() {
                    Some(Ok(value)) => Some(value.clone()),
                    _ => None,
                };
                value.map_or_else(func, Ok)
            },
            WeakDep(self.task.clone()),
        )
    }

    pub fn cancel(&self) -> bool {
        self.scheduler.cancel(&self.task)
    }

    pub fn result(&self) -> PromiseState<T> {
        match self.task.status() {
            TaskStatus::Completed => match self.slot.lock().clone() {
                Some(Ok(value)) => PromiseState::Ready(value),
                Some(Err(e)) => PromiseState::Failed(e),
                None => PromiseState::Failed(String::from("no value produced")),
            },
            TaskStatus::Failed => {
                let msg = match self.slot.lock().clone() {
                    Some(Err(e)) => e,
                    _ => String::from("task failed"),
                };
                PromiseState::Failed(msg)
            }
            TaskStatus::Canceled => PromiseState::Canceled,
            _ => PromiseState::Pending,
        }
    }

    /// Blocks until the promise settles, see [`Scheduler::wait`].
    pub fn get(&self, timeout: Duration) -> anyhow::Result<T> {
        self.scheduler.wait(std::slice::from_ref(&self.task), timeout)?;

        match self.result() {
            PromiseState::Ready(value) => Ok(value),
            PromiseState::Failed(e) => Err(anyhow!("promise failed: {e}")),
            PromiseState::Canceled => Err(anyhow!("promise canceled")),
            PromiseState::Pending => Err(anyhow!("promise still pending")),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("task", &self.task).finish()
    }
}
