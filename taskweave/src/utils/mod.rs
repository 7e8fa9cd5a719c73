pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

pub(crate) mod spin;
pub(crate) use spin::SpinLock;
