use std::fmt;

pub mod deps;
pub use deps::{
    CustomDep, Dependencies, Dependency, InterlockDep, InterlockFlag, Interlock, IntoDeps,
    StrongDep, StrongDeps, WeakDep, WeakDeps,
};

mod handle;
pub(crate) use handle::TaskCore;
pub use handle::{AsyncTask, MAX_DEPENDENCIES};

mod id;
pub use id::TaskId;

pub(crate) mod output;

mod run;
pub use run::{FnTask, Run, TaskContext, from_fn};

mod status;
pub use status::TaskStatus;

/// Queue category a task is affine to. Each category has its own sharded
/// queue, and threads declare which categories they serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ThreadType {
    Main = 0,
    Worker = 1,
    Renderer = 2,
    FileIO = 3,
    Network = 4,
}

impl ThreadType {
    pub const COUNT: usize = 5;

    pub const ALL: [ThreadType; Self::COUNT] = [
        ThreadType::Main,
        ThreadType::Worker,
        ThreadType::Renderer,
        ThreadType::FileIO,
        ThreadType::Network,
    ];

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ThreadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadType::Main => "main",
            ThreadType::Worker => "worker",
            ThreadType::Renderer => "renderer",
            ThreadType::FileIO => "file-io",
            ThreadType::Network => "network",
        };
        f.write_str(name)
    }
}
