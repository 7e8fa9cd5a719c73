use crate::scheduler::Scheduler;
use crate::thread::{Thread, ThreadMask};
use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// OS thread looping over the queues of the thread types in its mask.
///
/// Each pass offers every served queue one pull. A pass that found nothing
/// puts the thread to sleep for `sleep_on_idle`.
pub struct WorkerThread {
    name: String,
    mask: ThreadMask,
    sleep_on_idle: Duration,
    stack_size: Option<usize>,

    looping: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerThread {
    pub fn new(name: impl Into<String>, mask: ThreadMask, sleep_on_idle: Duration) -> Self {
        Self {
            name: name.into(),
            mask,
            sleep_on_idle,
            stack_size: None,
            looping: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn with_stack_size(mut self, stack_size: Option<usize>) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn mask(&self) -> ThreadMask {
        self.mask
    }

    pub fn is_attached(&self) -> bool {
        self.handle.lock().is_some()
    }
}

impl Thread for WorkerThread {
    fn attach(&self, scheduler: Scheduler, uid: u32) -> anyhow::Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(anyhow!("thread {} is already attached", self.name));
        }

        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }

        self.looping.store(true, Ordering::Release);

        let looping = self.looping.clone();
        let mask = self.mask;
        let sleep_on_idle = self.sleep_on_idle;

        let spawned = builder
            .spawn(move || {
                debug!(uid, ?mask, "worker loop started");

                let mut seed = fastrand::usize(..);
                while looping.load(Ordering::Acquire) {
                    let mut processed = false;

                    for thread_type in mask.thread_types() {
                        seed = seed.wrapping_add(1);
                        processed |= scheduler.process_task(thread_type, seed);
                    }

                    if !processed {
                        thread::sleep(sleep_on_idle);
                    }
                }

                debug!(uid, "worker loop stopped");
            })
            .with_context(|| format!("failed to spawn worker thread {}", self.name));

        match spawned {
            Ok(spawned) => {
                *handle = Some(spawned);
                Ok(())
            }
            Err(e) => {
                self.looping.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn detach(&self) -> anyhow::Result<()> {
        self.looping.store(false, Ordering::Release);

        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };

        trace!(thread.name = %self.name, "joining worker");
        handle
            .join()
            .map_err(|_| anyhow!("worker thread {} panicked", self.name))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThread")
            .field("name", &self.name)
            .field("mask", &self.mask)
            .field("sleep_on_idle", &self.sleep_on_idle)
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        // The loop owns a scheduler handle, it must not outlive us silently.
        if self.handle.get_mut().is_some() {
            let _ = self.detach();
        }
    }
}
