#[allow(clippy::module_inception)]
mod runtime;
pub(crate) use runtime::RuntimeConfig;
pub use runtime::{Builder, Runtime};
