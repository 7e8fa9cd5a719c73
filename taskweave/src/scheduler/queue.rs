use crate::task::{AsyncTask, Interlock, ThreadType};
use crate::utils::SpinLock;
use crossbeam_utils::{Backoff, CachePadded};
use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

thread_local! {
    // Starting shard for insertions made from this thread.
    static INSERT_SEED: Cell<Option<usize>> = const { Cell::new(None) };
}

fn insert_seed() -> usize {
    INSERT_SEED.with(|seed| match seed.get() {
        Some(seed) => seed,
        None => {
            let mut hasher = DefaultHasher::new();
            std::thread::current().id().hash(&mut hasher);

            let value = hasher.finish() as usize;
            seed.set(Some(value));
            value
        }
    })
}

/// A task taken out of a queue, together with the interlock acquired on its
/// behalf (if any). The interlock must be released once the episode ends.
pub(crate) struct Pulled {
    pub(crate) task: AsyncTask,
    pub(crate) interlock: Option<Arc<dyn Interlock>>,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    contended: AtomicU64,
    work_nanos: AtomicU64,
    stall_nanos: AtomicU64,
    insert_nanos: AtomicU64,
}

/// Snapshot of the profiling counters of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub shards: usize,

    /// Tasks handed to a thread, canceled ones included.
    pub processed: u64,

    /// Shard locks found busy, by pullers and inserters alike.
    pub contended: u64,

    /// Time spent inside task bodies.
    pub work: Duration,

    /// Time spent scanning shards without finding a ready task.
    pub stall: Duration,

    pub insert: Duration,
}

impl QueueStats {
    /// Fraction of the pulling time that found nothing to do.
    pub fn stall_ratio(&self) -> f64 {
        let total = self.work + self.stall;

        if total.is_zero() {
            0.0
        } else {
            self.stall.as_secs_f64() / total.as_secs_f64()
        }
    }
}

/// Sharded queue of one thread type.
///
/// Every shard is a spinlocked vector. Inserters and pullers only ever
/// `try_lock` a shard and move on to the next one when it is busy, so a
/// thread is never parked behind another one scanning a long shard.
pub(crate) struct TaskQueue {
    thread_type: ThreadType,
    shards: Box<[CachePadded<SpinLock<Vec<AsyncTask>>>]>,
    counters: Counters,
}

impl TaskQueue {
    pub(crate) fn new(thread_type: ThreadType, shards: usize) -> Self {
        debug_assert!(shards > 0);

        Self {
            thread_type,
            shards: (0..shards)
                .map(|_| CachePadded::new(SpinLock::new(Vec::new())))
                .collect(),
            counters: Counters::default(),
        }
    }

    pub(crate) fn thread_type(&self) -> ThreadType {
        self.thread_type
    }

    /// Appends `task` to the first free shard, starting from the one owned by
    /// the calling thread.
    pub(crate) fn push(&self, task: AsyncTask) {
        let start = Instant::now();
        let n = self.shards.len();
        let offset = insert_seed() % n;
        let backoff = Backoff::new();

        loop {
            for i in 0..n {
                if let Some(mut shard) = self.shards[(offset + i) % n].try_lock() {
                    shard.push(task);
                    drop(shard);

                    self.record(&self.counters.insert_nanos, start.elapsed());
                    return;
                }

                self.counters.contended.fetch_add(1, Ordering::Relaxed);
            }

            backoff.snooze();
        }
    }

    /// Removes the first pullable task, scanning shards from `seed`.
    ///
    /// A task is pullable when it must be canceled, or when its wait mask is
    /// empty and its interlock (if any) could be acquired. Busy shards are
    /// skipped.
    pub(crate) fn pull(&self, seed: usize) -> Option<Pulled> {
        let start = Instant::now();
        let n = self.shards.len();

        for i in 0..n {
            let Some(mut shard) = self.shards[seed.wrapping_add(i) % n].try_lock() else {
                self.counters.contended.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            if let Some((pos, interlock)) = find_pullable(&shard) {
                let task = shard.remove(pos);
                drop(shard);

                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                return Some(Pulled { task, interlock });
            }
        }

        self.record(&self.counters.stall_nanos, start.elapsed());
        None
    }

    /// Takes every queued task out, whatever its state.
    pub(crate) fn drain(&self) -> Vec<AsyncTask> {
        self.shards
            .iter()
            .flat_map(|shard| std::mem::take(&mut *shard.lock()))
            .collect()
    }

    /// Approximate, shards are locked one after the other.
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub(crate) fn record_work(&self, elapsed: Duration) {
        self.record(&self.counters.work_nanos, elapsed);
    }

    pub(crate) fn stats(&self) -> QueueStats {
        let nanos = |counter: &AtomicU64| Duration::from_nanos(counter.load(Ordering::Relaxed));

        QueueStats {
            shards: self.shards.len(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            contended: self.counters.contended.load(Ordering::Relaxed),
            work: nanos(&self.counters.work_nanos),
            stall: nanos(&self.counters.stall_nanos),
            insert: nanos(&self.counters.insert_nanos),
        }
    }

    fn record(&self, counter: &AtomicU64, elapsed: Duration) {
        counter.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }
}

// First ready task of the shard. Doomed tasks skip the interlock, they will
// only run `on_cancel`.
fn find_pullable(shard: &[AsyncTask]) -> Option<(usize, Option<Arc<dyn Interlock>>)> {
    for (pos, task) in shard.iter().enumerate() {
        let core = &task.0;

        if core.must_cancel() {
            return Some((pos, None));
        }

        if core.wait_bits.load(Ordering::Acquire) != 0 {
            continue;
        }

        let interlock = core.interlock.lock().clone();
        match interlock {
            None => return Some((pos, None)),
            Some(interlock) if interlock.try_lock() => return Some((pos, Some(interlock))),
            Some(_) => continue,
        }
    }

    None
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("thread_type", &self.thread_type)
            .field("shards", &self.shards.len())
            .finish()
    }
}
