//! Lock-free pools built on a shared bit-hierarchy.

pub(crate) mod bits;

mod fixed;
pub use fixed::{LfStaticPool, MAX_STATIC_CAPACITY};

mod indexed;
pub use indexed::{LfIndexedPool, MAX_CHUNK_SIZE, MAX_CHUNKS};

mod linear;
pub use linear::LfLinearAllocator;
