use std::marker::PhantomData;

/// Runs a closure when dropped.
///
/// The scheduler arms one around every task episode so the interlock acquired
/// for it is released on every exit path.
pub(crate) struct ScopeGuard<'a, F: FnOnce()> {
    closure: Option<F>,

    _p: PhantomData<&'a ()>,
}

impl<'a, F: FnOnce()> ScopeGuard<'a, F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
            _p: PhantomData,
        }
    }
}

impl<'a, F: FnOnce()> Drop for ScopeGuard<'a, F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
