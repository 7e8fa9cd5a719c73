use crate::deps::{EventDep, EventDependencyManager};
use crate::pool::{MAX_CHUNK_SIZE, MAX_CHUNKS, MAX_STATIC_CAPACITY};
use crate::scheduler::Scheduler;
use crate::task::ThreadType;
use crate::thread::{ThreadMask, WorkerThread};
use anyhow::{Result, anyhow};
use std::convert::TryFrom;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

/// Idle workers sleep this long before scanning their queues again.
const SLEEP_ON_IDLE: Duration = Duration::from_millis(10);

/// Default timeout of [`Scheduler::wait_all`].
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shards per queue, except for workers which scale with the thread count.
const DEFAULT_SHARDS: usize = 2;

const MAX_WORKER_SHARDS: usize = 16;

/// Output chunks per pool chunk. 256 chunks of 15 edges each.
const OUTPUT_CHUNK_SIZE: usize = 256;

const OUTPUT_MAX_CHUNKS: usize = MAX_CHUNKS;

/// Tasks that can wait on an unsignaled event at the same time.
const EVENT_POOL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("taskweave-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Threads serving the `Worker` queue. Defaults to 1 per core. Zero means
    /// the caller drives every queue through `Scheduler::process_task`.
    worker_threads: Option<usize>,

    /// Extra threads, each serving its own set of queues.
    dedicated_threads: Vec<ThreadMask>,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the runtime.
    thread_stack_size: Option<usize>,

    sleep_on_idle: Duration,

    wait_timeout: Duration,

    /// Shard count override per thread type.
    shards: [Option<usize>; ThreadType::COUNT],

    /// Shape of the pool backing every task's output list.
    output_chunk_size: usize,
    output_max_chunks: usize,

    /// `None` leaves `EventDep` without a manager.
    event_pool_capacity: Option<usize>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Self {
            worker_threads: None,
            dedicated_threads: Vec::new(),
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            sleep_on_idle: SLEEP_ON_IDLE,
            wait_timeout: WAIT_TIMEOUT,
            shards: [None; ThreadType::COUNT],
            output_chunk_size: OUTPUT_CHUNK_SIZE,
            output_max_chunks: OUTPUT_MAX_CHUNKS,
            event_pool_capacity: Some(EVENT_POOL_CAPACITY),
        }
    }

    /// The number of threads serving the `Worker` queue.
    ///
    /// Defaults to 1 per CPU core. Tasks of the other thread types only run
    /// on threads added with [`dedicated_thread`](Self::dedicated_thread), or
    /// on whoever calls `process_task` for their type (typically the main
    /// thread for `ThreadType::Main`).
    pub fn worker_threads(mut self, val: usize) -> Self {
        self.worker_threads = Some(val);
        self
    }

    /// Adds a thread serving the queues in `mask`.
    #[track_caller]
    pub fn dedicated_thread(mut self, mask: ThreadMask) -> Self {
        assert!(!mask.is_empty(), "dedicated_thread mask must not be empty");
        self.dedicated_threads.push(mask);
        self
    }

    /// Sets name of threads spawned by the `Runtime`.
    ///
    /// The default name is "taskweave-{id}", where id is monotonically
    /// increasing.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for spawned threads.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    pub fn sleep_on_idle(mut self, val: Duration) -> Self {
        self.sleep_on_idle = val;
        self
    }

    #[track_caller]
    pub fn wait_timeout(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "wait_timeout must be greater than 0");
        self.wait_timeout = val;
        self
    }

    /// Number of shards of the queue of `thread_type`.
    ///
    /// Defaults to 2, and for `Worker` to a third of the worker threads
    /// clamped to `2..=16`.
    #[track_caller]
    pub fn shard_count(mut self, thread_type: ThreadType, val: usize) -> Self {
        assert!(val > 0, "shard_count must be greater than 0");
        self.shards[thread_type.index()] = Some(val);
        self
    }

    #[track_caller]
    pub fn output_chunk_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two() && val <= MAX_CHUNK_SIZE,
            "output_chunk_size must be a power of two <= {MAX_CHUNK_SIZE}"
        );
        self.output_chunk_size = val;
        self
    }

    #[track_caller]
    pub fn output_max_chunks(mut self, val: usize) -> Self {
        assert!(
            val > 0 && val <= MAX_CHUNKS,
            "output_max_chunks must be in 1..={MAX_CHUNKS}"
        );
        self.output_max_chunks = val;
        self
    }

    /// Capacity of the built-in `EventDep` manager, `None` to not register it.
    #[track_caller]
    pub fn event_pool_capacity(mut self, val: Option<usize>) -> Self {
        if let Some(capacity) = val {
            assert!(
                capacity > 0 && capacity <= MAX_STATIC_CAPACITY,
                "event_pool_capacity must be in 1..={MAX_STATIC_CAPACITY}"
            );
        }
        self.event_pool_capacity = val;
        self
    }

    /// Creates the configured `Runtime`, its threads already pulling.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg = RuntimeConfig::try_from(self)?;
        let runtime = Runtime::new(Scheduler::new(&cfg)?);

        if let Some(capacity) = cfg.event_pool_capacity {
            runtime.register_dependency_manager::<EventDep>(EventDependencyManager::new(capacity)?);
        }

        let masks = std::iter::repeat_n(ThreadMask::WORKER, cfg.worker_threads)
            .chain(cfg.dedicated_threads.iter().copied());

        // A failure here drops `runtime`, which detaches what was attached.
        for mask in masks {
            let thread = WorkerThread::new(cfg.thread_name.0(), mask, cfg.sleep_on_idle)
                .with_stack_size(cfg.thread_stack_size);
            runtime.add_thread(Arc::new(thread))?;
        }

        debug!(
            worker_threads = cfg.worker_threads,
            dedicated_threads = cfg.dedicated_threads.len(),
            shards = ?cfg.shards,
            "runtime started"
        );

        Ok(runtime)
    }
}

#[derive(Debug)]
pub struct Runtime {
    scheduler: Scheduler,
}

impl Runtime {
    pub(super) fn new(scheduler: Scheduler) -> Runtime {
        Runtime { scheduler }
    }

    pub fn handle(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Shutdown the runtime.
    ///
    /// Blocks until every thread finished its current task. Tasks still
    /// queued are canceled. The `Drop` implementation does the same and logs
    /// the error instead of returning it.
    pub fn shutdown(self) -> Result<()> {
        self.scheduler.shutdown()
    }
}

impl Deref for Runtime {
    type Target = Scheduler;

    fn deref(&self) -> &Self::Target {
        &self.scheduler
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.scheduler.shutdown() {
            error!(error = ?e, "error during runtime shutdown");
        }
    }
}

// Export runtime builder as a RuntimeConfig object consumed by the scheduler.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) dedicated_threads: Vec<ThreadMask>,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) sleep_on_idle: Duration,
    pub(crate) wait_timeout: Duration,
    pub(crate) shards: [usize; ThreadType::COUNT],
    pub(crate) output_chunk_size: usize,
    pub(crate) output_max_chunks: usize,
    pub(crate) event_pool_capacity: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: 0,
            dedicated_threads: Vec::new(),
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            sleep_on_idle: SLEEP_ON_IDLE,
            wait_timeout: WAIT_TIMEOUT,
            shards: [DEFAULT_SHARDS; ThreadType::COUNT],
            output_chunk_size: OUTPUT_CHUNK_SIZE,
            output_max_chunks: OUTPUT_MAX_CHUNKS,
            event_pool_capacity: Some(EVENT_POOL_CAPACITY),
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.shards.contains(&0) {
            return Err(anyhow!("every queue needs at least one shard"));
        }

        let chunk_ok = self.output_chunk_size.is_power_of_two()
            && self.output_chunk_size <= MAX_CHUNK_SIZE;
        let chunks_ok = (1..=MAX_CHUNKS).contains(&self.output_max_chunks);

        if !chunk_ok || !chunks_ok {
            return Err(anyhow!(
                "invalid output pool shape: {} x {}",
                self.output_chunk_size,
                self.output_max_chunks
            ));
        }

        Ok(())
    }
}

/// Worker shards grow with the thread count so pullers rarely collide.
fn worker_shards(worker_threads: usize) -> usize {
    worker_threads.div_ceil(3).clamp(DEFAULT_SHARDS, MAX_WORKER_SHARDS)
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let shards = std::array::from_fn(|i| {
            builder.shards[i].unwrap_or(if i == ThreadType::Worker.index() {
                worker_shards(worker_threads)
            } else {
                DEFAULT_SHARDS
            })
        });

        let cfg = RuntimeConfig {
            worker_threads,
            dedicated_threads: builder.dedicated_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            sleep_on_idle: builder.sleep_on_idle,
            wait_timeout: builder.wait_timeout,
            shards,
            output_chunk_size: builder.output_chunk_size,
            output_max_chunks: builder.output_max_chunks,
            event_pool_capacity: builder.event_pool_capacity,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
