use crate::scheduler::{Pulled, Scheduler};
use crate::task::{AsyncTask, Run, TaskContext, TaskStatus, ThreadType};
use crate::utils::ScopeGuard;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{Ordering, fence};
use std::time::Instant;
use tracing::{error, trace};

/// What to do with a task once its body returned.
enum Episode {
    Finished,
    Requeue,
}

impl Scheduler {
    /// Pulls one task from the queue of `thread_type` and drives it.
    ///
    /// `seed` picks the first shard to scan, threads pass an incrementing
    /// value so they spread over the shards. Returns false if nothing was
    /// pullable.
    pub fn process_task(&self, thread_type: ThreadType, seed: usize) -> bool {
        let Some(pulled) = self.pull_task(thread_type, seed) else {
            return false;
        };

        let start = Instant::now();
        self.execute(pulled);
        self.queue(thread_type).record_work(start.elapsed());

        true
    }

    /// Processes tasks of `thread_type` until none is pullable. Returns how
    /// many were processed.
    pub fn run_until_idle(&self, thread_type: ThreadType) -> usize {
        let mut seed = 0usize;
        let mut processed = 0;

        while self.process_task(thread_type, seed) {
            seed = seed.wrapping_add(1);
            processed += 1;
        }

        processed
    }

    pub(crate) fn pull_task(&self, thread_type: ThreadType, seed: usize) -> Option<Pulled> {
        let pulled = self.queue(thread_type).pull(seed)?;

        // Pairs with the release RMWs that cleared the wait bits, so the
        // effects of every predecessor are visible to the body.
        fence(Ordering::Acquire);

        Some(pulled)
    }

    fn execute(&self, pulled: Pulled) {
        let Pulled { task, interlock } = pulled;

        let unlock = ScopeGuard::new(|| {
            if let Some(interlock) = &interlock {
                interlock.unlock();
            }
        });

        if task.0.canceled_deps.load(Ordering::Acquire) > 0 {
            self.cancel_queued(&task);
            return;
        }

        match task.0.status.compare_exchange(TaskStatus::Pending, TaskStatus::InProgress) {
            Ok(()) => {}
            Err(TaskStatus::Cancellation) => {
                self.cancel_queued(&task);
                return;
            }
            Err(found) => {
                error!(task.id = %task.id(), status = %found, "pulled a task which is not pending");
                debug_assert!(false, "pulled a task in state {found}");
                return;
            }
        }

        trace!(task.id = %task.id(), task.name = task.name(), "running");

        if let Episode::Requeue = self.run_body(&task, unlock) {
            self.queue(task.thread_type()).push(task);
        }
    }

    fn run_body<F: FnOnce()>(&self, task: &AsyncTask, unlock: ScopeGuard<'_, F>) -> Episode {
        let core = &task.0;
        let mut body = core.body.lock();

        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut cx = TaskContext::new(self, task);
            body.run(&mut cx);
        }));

        // Free before anyone can observe the episode's outcome, or pull the
        // task again.
        drop(unlock);

        if res.is_err() {
            error!(task.id = %task.id(), task.name = task.name(), "task panicked");

            let _ = core.status.transition(
                |s| matches!(s, TaskStatus::InProgress | TaskStatus::Continue),
                TaskStatus::Failed,
            );
        }

        loop {
            match core.status.load(Ordering::Acquire) {
                TaskStatus::InProgress => {
                    if core
                        .status
                        .compare_exchange(TaskStatus::InProgress, TaskStatus::Completed)
                        .is_ok()
                    {
                        self.release_outputs(task, false);
                        return Episode::Finished;
                    }
                }
                TaskStatus::Continue => {
                    if core
                        .status
                        .compare_exchange(TaskStatus::Continue, TaskStatus::Pending)
                        .is_ok()
                    {
                        trace!(task.id = %task.id(), "requeued");
                        return Episode::Requeue;
                    }
                }
                TaskStatus::Cancellation => {
                    run_on_cancel(task, &mut **body);
                    core.status.store(TaskStatus::Canceled, Ordering::Release);
                    self.release_outputs(task, true);
                    return Episode::Finished;
                }
                TaskStatus::Failed => {
                    self.release_outputs(task, false);
                    return Episode::Finished;
                }
                other => {
                    error!(task.id = %task.id(), status = %other, "unexpected status after run");
                    return Episode::Finished;
                }
            }
        }
    }

    /// Cancels a task which was never claimed: runs `on_cancel`, moves it to
    /// `Canceled` and cancels its strong dependents.
    pub(crate) fn cancel_queued(&self, task: &AsyncTask) {
        let core = &task.0;

        let res = core.status.transition(
            |s| {
                matches!(
                    s,
                    TaskStatus::Initial | TaskStatus::Pending | TaskStatus::Cancellation
                )
            },
            TaskStatus::Cancellation,
        );

        if let Err(found) = res {
            error!(task.id = %task.id(), status = %found, "cannot cancel task");
            return;
        }

        run_on_cancel(task, &mut **core.body.lock());
        core.status.store(TaskStatus::Canceled, Ordering::Release);

        trace!(
            task.id = %task.id(),
            task.name = task.name(),
            canceled_deps = task.canceled_deps_count(),
            "canceled"
        );

        self.release_outputs(task, true);
    }

    pub(super) fn release_outputs(&self, task: &AsyncTask, canceled: bool) {
        // The terminal status and every effect of the body happen before any
        // dependent observes its bit cleared.
        fence(Ordering::Release);

        let released = task.0.output.lock().release(canceled);
        trace!(task.id = %task.id(), status = %task.status(), released, "finished");
    }
}

fn run_on_cancel(task: &AsyncTask, body: &mut dyn Run) {
    if panic::catch_unwind(AssertUnwindSafe(|| body.on_cancel())).is_err() {
        error!(task.id = %task.id(), task.name = task.name(), "on_cancel panicked");
    }
}
