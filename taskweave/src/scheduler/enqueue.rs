use crate::deps::DependencyManager;
use crate::error::SchedulerError;
use crate::pool::bits::low_mask;
use crate::scheduler::Scheduler;
use crate::task::deps::INLINE_DEPS;
use crate::task::output::{AddOutput, Edge};
use crate::task::{
    AsyncTask, CustomDep, Dependencies, Dependency, IntoDeps, MAX_DEPENDENCIES, TaskStatus,
};
use anyhow::anyhow;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{error, trace};

impl Scheduler {
    /// Registers `deps` on `task` and pushes it to the queue of its thread
    /// type.
    ///
    /// The task must be `Initial` (fresh, or re-armed through
    /// [`AsyncTask::reset_for_reuse`]). A task canceled before being enqueued
    /// is accepted: it is queued so that `on_cancel` runs on its own thread
    /// type.
    ///
    /// On error nothing is queued and no predecessor keeps an edge to the
    /// task. The task stays `Initial` and can be enqueued again, unless a
    /// dependency manager had already taken over part of it: the task then
    /// ends `Failed` and its own dependents are released.
    pub fn enqueue<D: IntoDeps>(&self, task: &AsyncTask, deps: D) -> Result<(), SchedulerError> {
        if self.is_shutdown() {
            return Err(SchedulerError::Shutdown);
        }

        let status = task.status();
        if !matches!(status, TaskStatus::Initial | TaskStatus::Cancellation) {
            return Err(SchedulerError::InvalidState {
                expected: "Initial",
                found: status,
            });
        }

        if let Err(Unregistered { error, managed }) =
            self.register_dependencies(task, deps.into_deps())
        {
            error!(
                task.id = %task.id(),
                task.name = task.name(),
                error = %error,
                managed,
                "enqueue failed"
            );
            self.abort_enqueue(task, managed);
            return Err(error);
        }

        match task.0.status.compare_exchange(TaskStatus::Initial, TaskStatus::Pending) {
            Ok(()) | Err(TaskStatus::Cancellation) => {}
            Err(found) => {
                return Err(SchedulerError::InvalidState {
                    expected: "Initial",
                    found,
                });
            }
        }

        trace!(
            task.id = %task.id(),
            task.name = task.name(),
            thread_type = %task.thread_type(),
            wait_bits = format_args!("{:#x}", task.wait_bits()),
            "enqueued"
        );

        self.queue(task.thread_type()).push(task.clone());
        Ok(())
    }

    /// Re-arms a running task behind `deps`. See
    /// [`TaskContext::continue_with`](crate::task::TaskContext::continue_with).
    ///
    /// A registration error leaves the task `Failed`, still waiting only on
    /// the bits a dependency manager took.
    pub(crate) fn continue_task(
        &self,
        task: &AsyncTask,
        deps: Dependencies,
    ) -> Result<(), SchedulerError> {
        let core = &task.0;

        core.status
            .compare_exchange(TaskStatus::InProgress, TaskStatus::Continue)
            .map_err(|found| SchedulerError::InvalidState {
                expected: "InProgress",
                found,
            })?;

        core.wait_bits.store(u64::MAX, Ordering::Release);

        if let Err(Unregistered { error, managed }) = self.register_dependencies(task, deps) {
            error!(task.id = %task.id(), task.name = task.name(), error = %error, "continue failed");

            if !managed {
                core.wait_bits.store(0, Ordering::Release);
            }

            // A concurrent cancel wins, the task is going away either way.
            let _ = core.status.compare_exchange(TaskStatus::Continue, TaskStatus::Failed);
            return Err(error);
        }

        trace!(
            task.id = %task.id(),
            wait_bits = format_args!("{:#x}", task.wait_bits()),
            "continuation registered"
        );

        Ok(())
    }

    /// Puts a task whose registration failed back where it was, or fails it
    /// for good when a manager still holds some of its wait bits.
    fn abort_enqueue(&self, task: &AsyncTask, managed: bool) {
        let core = &task.0;

        if !managed {
            // Nothing can reach the task anymore.
            core.canceled_deps.store(0, Ordering::Relaxed);
            core.wait_bits.store(u64::MAX, Ordering::Release);
            return;
        }

        let res = core.status.transition(
            |s| matches!(s, TaskStatus::Initial | TaskStatus::Cancellation),
            TaskStatus::Failed,
        );

        if res.is_ok() {
            self.release_outputs(task, false);
        }
    }

    /// Requests cancellation of `task`.
    ///
    /// Succeeds from `Initial`, `Pending` and `Continue`. The task is not
    /// canceled synchronously: a puller runs its `on_cancel` and notifies its
    /// dependents. Returns false if the task is running, finished, or
    /// already being canceled.
    pub fn cancel(&self, task: &AsyncTask) -> bool {
        let res = task.0.status.transition(
            |s| {
                matches!(
                    s,
                    TaskStatus::Initial | TaskStatus::Pending | TaskStatus::Continue
                )
            },
            TaskStatus::Cancellation,
        );

        trace!(task.id = %task.id(), from = ?res, "cancel requested");
        res.is_ok()
    }

    /// Resolves every dependency of `deps` into wait bits of `task`.
    ///
    /// Everything that can be checked up front is, before any predecessor is
    /// touched. Task edges take the low bits and are linked first, custom
    /// dependencies come last. On failure the linked edges are removed again
    /// and the wait mask only keeps the bits a manager may still clear.
    fn register_dependencies(
        &self,
        task: &AsyncTask,
        deps: Dependencies,
    ) -> Result<(), Unregistered> {
        let requested = deps.iter().map(Dependency::static_bits).sum::<usize>();
        if requested > MAX_DEPENDENCIES {
            return Err(Unregistered::clean(SchedulerError::TooManyDependencies {
                requested,
                max: MAX_DEPENDENCIES,
            }));
        }

        let mut preds: SmallVec<[(AsyncTask, bool); INLINE_DEPS]> = SmallVec::new();
        let mut customs: SmallVec<[(Arc<dyn DependencyManager>, CustomDep); 2]> = SmallVec::new();
        let mut interlock = None;

        for dep in deps {
            match dep {
                Dependency::Task { task: pred, strong } => {
                    if pred.ptr_eq(task) {
                        let err = anyhow!("task {} cannot depend on itself", task.id());
                        return Err(Unregistered::clean(err.into()));
                    }
                    preds.push((pred, strong));
                }
                Dependency::Interlock(lock) => {
                    if interlock.replace(lock).is_some() {
                        return Err(Unregistered::clean(SchedulerError::DuplicateInterlock));
                    }
                }
                Dependency::Custom(dep) => {
                    let manager = self.shared.managers.get(dep.type_id()).ok_or_else(|| {
                        Unregistered::clean(SchedulerError::UnknownDependency(dep.type_name()))
                    })?;
                    customs.push((manager, dep));
                }
            }
        }

        let core = &task.0;
        let mut bit_index = 0u32;

        for (pred, strong) in &preds {
            if let Err(e) = self.link(task, pred, *strong, &mut bit_index) {
                self.rollback(task, &preds, bit_index);
                return Err(Unregistered::clean(e));
            }
        }

        for (manager, dep) in customs {
            if let Err(e) = manager.resolve(self, dep, task, &mut bit_index) {
                self.rollback(task, &preds, bit_index);
                return Err(Unregistered {
                    error: e,
                    managed: bit_index as usize > preds.len(),
                });
            }
        }

        if let Some(lock) = interlock {
            *core.interlock.lock() = Some(lock);
        }

        core.wait_bits
            .fetch_and(low_mask(bit_index as usize), Ordering::Release);

        Ok(())
    }

    /// Records `task` as a dependent of `pred` through the next wait bit.
    fn link(
        &self,
        task: &AsyncTask,
        pred: &AsyncTask,
        strong: bool,
        bit_index: &mut u32,
    ) -> Result<(), SchedulerError> {
        let bit = crate::deps::next_wait_bit(bit_index)?;
        let edge = Edge {
            task: task.clone(),
            bit: bit as u8,
            strong,
        };

        let outcome = {
            let mut output = pred.0.output.lock();
            let status = pred.0.status.load(Ordering::Acquire);
            output.add(&self.shared.output_pool, status, edge)?
        };

        if let AddOutput::Finished(status) = outcome {
            // Failure never propagates, only a canceled strong predecessor
            // dooms us.
            task.0
                .complete_dependency(bit, strong && status == TaskStatus::Canceled);
        }

        Ok(())
    }

    /// Undoes a partial registration: unlinks `task` from every predecessor
    /// and clears every bit no manager can clear anymore.
    ///
    /// Once a predecessor's lock was taken here it can no longer touch the
    /// task, so the task edges are dead afterwards.
    fn rollback(&self, task: &AsyncTask, preds: &[(AsyncTask, bool)], bit_index: u32) {
        let unlinked = preds
            .iter()
            .map(|(pred, _)| pred.0.output.lock().unlink(task))
            .sum::<usize>();

        let managed = low_mask(bit_index as usize) & !low_mask(preds.len());
        task.0.wait_bits.fetch_and(managed, Ordering::Release);

        trace!(
            task.id = %task.id(),
            unlinked,
            wait_bits = format_args!("{:#x}", task.wait_bits()),
            "registration rolled back"
        );
    }
}

/// A registration that did not go through.
struct Unregistered {
    error: SchedulerError,

    /// A dependency manager reserved wait bits before the failure and may
    /// still clear them, so the task cannot be registered again.
    managed: bool,
}

impl Unregistered {
    fn clean(error: SchedulerError) -> Self {
        Self {
            error,
            managed: false,
        }
    }
}
