//! Threads pulling work from a [`Scheduler`].

use crate::scheduler::Scheduler;
use crate::task::ThreadType;
use bitflags::bitflags;

mod worker;
pub use worker::WorkerThread;

/// Something that drives a scheduler once attached.
///
/// `attach` hands over a scheduler handle and a unique id, `detach` must stop
/// pulling and only return once no task of this thread is running anymore.
pub trait Thread: Send + Sync + 'static {
    fn attach(&self, scheduler: Scheduler, uid: u32) -> anyhow::Result<()>;

    fn detach(&self) -> anyhow::Result<()>;

    fn name(&self) -> &str;
}

bitflags! {
    /// Set of thread types a thread serves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThreadMask: u8 {
        const MAIN = 1 << 0;
        const WORKER = 1 << 1;
        const RENDERER = 1 << 2;
        const FILE_IO = 1 << 3;
        const NETWORK = 1 << 4;
    }
}

impl ThreadMask {
    pub fn serves(self, thread_type: ThreadType) -> bool {
        self.contains(thread_type.into())
    }

    /// Thread types in the mask, in `ThreadType` order.
    pub fn thread_types(self) -> impl Iterator<Item = ThreadType> {
        ThreadType::ALL.into_iter().filter(move |&tt| self.serves(tt))
    }
}

impl From<ThreadType> for ThreadMask {
    fn from(thread_type: ThreadType) -> Self {
        ThreadMask::from_bits_truncate(1u8 << thread_type.index())
    }
}
