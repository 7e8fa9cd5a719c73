use crate::error::SchedulerError;
use crate::scheduler::Scheduler;
use crate::task::deps::IntoDeps;
use crate::task::{AsyncTask, TaskStatus, ThreadType};
use std::borrow::Cow;
use std::fmt;
use tracing::trace;

/// The contract a unit of work implements.
///
/// `run` must not block: a task that needs more input registers new
/// dependencies through [`TaskContext::continue_with`] and returns.
pub trait Run: Send + 'static {
    fn run(&mut self, cx: &mut TaskContext<'_>);

    /// Called instead of `run` when the task is canceled, or after `run` if
    /// the cancellation landed while the task was re-armed.
    fn on_cancel(&mut self) {}

    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }

    /// Queue category the task runs on.
    fn thread_type(&self) -> ThreadType {
        ThreadType::Worker
    }
}

/// Handed to [`Run::run`], gives access to the scheduler and to the
/// suspension and failure points of the running task.
pub struct TaskContext<'a> {
    scheduler: &'a Scheduler,
    task: &'a AsyncTask,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(scheduler: &'a Scheduler, task: &'a AsyncTask) -> Self {
        Self { scheduler, task }
    }

    pub fn scheduler(&self) -> &'a Scheduler {
        self.scheduler
    }

    pub fn task(&self) -> &'a AsyncTask {
        self.task
    }

    /// Asks to be run again once `deps` resolve. Passing `()` requeues the
    /// task immediately.
    ///
    /// Effective when `run` returns. A cancel request that arrives in the
    /// meantime turns the requeue into a call to `on_cancel`.
    pub fn continue_with<D: IntoDeps>(&mut self, deps: D) -> Result<(), SchedulerError> {
        self.scheduler.continue_task(self.task, deps.into_deps())
    }

    /// Reports an internal error: the task ends `Failed` when `run` returns.
    ///
    /// Returns false if the task is not running (or already failed).
    pub fn fail(&mut self) -> bool {
        let res = self.task.0.status.transition(
            |s| matches!(s, TaskStatus::InProgress | TaskStatus::Continue),
            TaskStatus::Failed,
        );

        trace!(task.id = %self.task.id(), ok = res.is_ok(), "fail requested");
        res.is_ok()
    }

    /// A cancel request landed after `continue_with`.
    pub fn is_cancellation_requested(&self) -> bool {
        self.task.status() == TaskStatus::Cancellation
    }
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext").field("task", self.task).finish()
    }
}

/// [`Run`] adapter for closures, see [`from_fn`].
pub struct FnTask<F> {
    func: F,
    name: Cow<'static, str>,
    thread_type: ThreadType,
}

impl<F> Run for FnTask<F>
where
    F: FnMut(&mut TaskContext<'_>) + Send + 'static,
{
    fn run(&mut self, cx: &mut TaskContext<'_>) {
        (self.func)(cx)
    }

    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn thread_type(&self) -> ThreadType {
        self.thread_type
    }
}

/// Builds a task body from a closure.
pub fn from_fn<F>(thread_type: ThreadType, name: impl Into<Cow<'static, str>>, func: F) -> FnTask<F>
where
    F: FnMut(&mut TaskContext<'_>) + Send + 'static,
{
    FnTask {
        func,
        name: name.into(),
        thread_type,
    }
}
