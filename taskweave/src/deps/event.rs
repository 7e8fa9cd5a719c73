use crate::deps::{DependencyManager, next_wait_bit, set_dependency_completion};
use crate::error::{PoolError, SchedulerError};
use crate::pool::LfStaticPool;
use crate::scheduler::Scheduler;
use crate::task::{AsyncTask, CustomDep, Run, TaskContext, ThreadType};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{error, trace};

/// Flag that stays set until reset, used to gate tasks on something that
/// happens outside the scheduler.
#[derive(Debug, Default)]
pub struct ManualEvent {
    set: AtomicBool,
}

impl ManualEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self) {
        self.set.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.set.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }
}

/// Dependency argument resolved by [`EventDependencyManager`]. Wrap it in a
/// [`CustomDep`] when declaring dependencies.
#[derive(Debug, Clone)]
pub struct EventDep(pub Arc<ManualEvent>);

struct PendingEvent {
    event: Arc<ManualEvent>,
    task: AsyncTask,
    bit: u32,
}

struct EventQueue {
    pending: LfStaticPool<PendingEvent>,

    // Records owned by the manager, counted before they are stored so the
    // poller can never observe more records than were counted.
    count: AtomicUsize,

    poll_on: ThreadType,
}

/// Gates tasks on [`ManualEvent`]s.
///
/// Pending `(event, task, bit)` records live in a static pool. The first
/// record spawns a poller task which clears the bits of signaled events and
/// re-arms itself while records remain.
pub struct EventDependencyManager {
    queue: Arc<EventQueue>,
}

impl EventDependencyManager {
    pub fn new(capacity: usize) -> Result<Arc<Self>, PoolError> {
        Self::with_thread_type(capacity, ThreadType::Worker)
    }

    /// Like `new`, polling on the queue of `poll_on`.
    pub fn with_thread_type(capacity: usize, poll_on: ThreadType) -> Result<Arc<Self>, PoolError> {
        Ok(Arc::new(Self {
            queue: Arc::new(EventQueue {
                pending: LfStaticPool::new(capacity)?,
                count: AtomicUsize::new(0),
                poll_on,
            }),
        }))
    }

    /// Records still waiting on their event.
    pub fn pending(&self) -> usize {
        self.queue.count.load(Ordering::Acquire)
    }
}

impl DependencyManager for EventDependencyManager {
    fn resolve(
        &self,
        scheduler: &Scheduler,
        dep: CustomDep,
        task: &AsyncTask,
        bit_index: &mut u32,
    ) -> Result<(), SchedulerError> {
        let EventDep(event) = dep
            .downcast::<EventDep>()
            .map_err(|dep| SchedulerError::UnknownDependency(dep.type_name()))?;

        // Already signaled, no need to wait on anything.
        if event.is_set() {
            return Ok(());
        }

        // The bit is only taken once the record is parked, a full pool
        // leaves the task untouched.
        let mut next = *bit_index;
        let bit = next_wait_bit(&mut next)?;
        let first = self.queue.count.fetch_add(1, Ordering::AcqRel) == 0;

        let record = PendingEvent {
            event,
            task: task.clone(),
            bit,
        };

        if self.queue.pending.put(record).is_err() {
            self.queue.count.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::Exhausted.into());
        }
        *bit_index = next;

        if first {
            scheduler.spawn(
                EventPoller {
                    queue: self.queue.clone(),
                    carry: Vec::new(),
                    idle: 0,
                },
                (),
            )?;
        }

        Ok(())
    }
}

impl fmt::Debug for EventDependencyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDependencyManager")
            .field("pending", &self.pending())
            .field("capacity", &self.queue.pending.capacity())
            .finish()
    }
}

/// Idle passes the poller only yields through before it starts sleeping.
const POLL_YIELDS: u32 = 4;

const POLL_MIN_SLEEP: Duration = Duration::from_micros(50);
const POLL_MAX_SLEEP: Duration = Duration::from_millis(1);

/// Pause before the next pass after `idle` passes that signaled nothing:
/// `None` to just yield, then sleeps doubling up to [`POLL_MAX_SLEEP`].
fn idle_pause(idle: u32) -> Option<Duration> {
    let exp = idle.checked_sub(POLL_YIELDS)?;
    let sleep = POLL_MIN_SLEEP.saturating_mul(1 << exp.min(8));

    Some(sleep.min(POLL_MAX_SLEEP))
}

struct EventPoller {
    queue: Arc<EventQueue>,

    // Unsignaled records that did not fit back into the pool.
    carry: Vec<PendingEvent>,

    // Consecutive passes that signaled nothing.
    idle: u32,
}

impl EventPoller {
    fn drain(&mut self) -> Vec<PendingEvent> {
        let available = self.queue.pending.len();
        let mut records = std::mem::take(&mut self.carry);
        records.extend((0..available).map_while(|_| self.queue.pending.extract()));
        records
    }
}

impl Run for EventPoller {
    fn run(&mut self, cx: &mut TaskContext<'_>) {
        let mut signaled = 0;

        for record in self.drain() {
            if record.event.is_set() {
                set_dependency_completion(&record.task, record.bit, false);
                signaled += 1;
            } else if let Err(record) = self.queue.pending.put(record) {
                self.carry.push(record);
            }
        }

        let before = self.queue.count.fetch_sub(signaled, Ordering::AcqRel);
        trace!(signaled, remaining = before - signaled, "event poll");

        if before == signaled {
            return;
        }

        // Keeps a pending event from pinning a thread at full speed.
        self.idle = if signaled > 0 { 0 } else { self.idle.saturating_add(1) };
        match idle_pause(self.idle) {
            Some(pause) => thread::sleep(pause),
            None => thread::yield_now(),
        }

        if let Err(e) = cx.continue_with(()) {
            error!(error = %e, "event poller failed to re-arm");
        }
    }

    fn on_cancel(&mut self) {
        // Nobody is going to signal these anymore.
        let records = self.drain();
        self.queue.count.fetch_sub(records.len(), Ordering::AcqRel);

        for record in records {
            set_dependency_completion(&record.task, record.bit, true);
        }
    }

    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("event-poller")
    }

    fn thread_type(&self) -> ThreadType {
        self.queue.poll_on
    }
}
