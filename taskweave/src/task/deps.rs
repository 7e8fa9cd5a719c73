//! Dependency declaration vocabulary.
//!
//! Anything implementing [`IntoDeps`] can be passed where the scheduler expects
//! dependencies: a bare [`AsyncTask`] (strong), [`WeakDep`], [`StrongDep`],
//! their array forms, an [`InterlockDep`], a [`CustomDep`], or a tuple of up
//! to eight of those.

use crate::task::AsyncTask;
use smallvec::SmallVec;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Dependencies kept inline before spilling to the heap.
pub(crate) const INLINE_DEPS: usize = 8;

pub type Dependencies = SmallVec<[Dependency; INLINE_DEPS]>;

/// Gates start time only: the dependent runs however the predecessor ends.
#[derive(Debug, Clone)]
pub struct WeakDep(pub AsyncTask);

/// The dependent is canceled if the predecessor ends canceled.
#[derive(Debug, Clone)]
pub struct StrongDep(pub AsyncTask);

#[derive(Debug, Clone, Default)]
pub struct WeakDeps(pub Vec<AsyncTask>);

#[derive(Debug, Clone, Default)]
pub struct StrongDeps(pub Vec<AsyncTask>);

/// Mutual-exclusion gate acquired before `run` and released once the task
/// finished the episode, whatever the outcome.
pub trait Interlock: Send + Sync {
    fn try_lock(&self) -> bool;

    fn unlock(&self);
}

/// Simplest [`Interlock`]: a shared flag.
#[derive(Debug, Default)]
pub struct InterlockFlag {
    locked: AtomicBool,
}

impl InterlockFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Interlock for InterlockFlag {
    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        let was_locked = self.locked.swap(false, Ordering::Release);
        debug_assert!(was_locked, "unlocking an interlock which is not held");
    }
}

#[derive(Clone)]
pub struct InterlockDep(pub Arc<dyn Interlock>);

impl fmt::Debug for InterlockDep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InterlockDep").field(&"<interlock>").finish()
    }
}

/// Dependency on something that is not a task, resolved by the dependency
/// manager registered for `T` (see
/// [`Scheduler::register_dependency_manager`](crate::Scheduler::register_dependency_manager)).
pub struct CustomDep {
    type_id: TypeId,
    type_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

impl CustomDep {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            value: Box::new(value),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn value(&self) -> &(dyn Any + Send + Sync) {
        self.value.as_ref()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    /// Takes the value out, handing the dependency back on type mismatch.
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        let Self {
            type_id,
            type_name,
            value,
        } = self;

        value.downcast::<T>().map(|v| *v).map_err(|value| Self {
            type_id,
            type_name,
            value,
        })
    }
}

impl fmt::Debug for CustomDep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomDep")
            .field("type", &self.type_name)
            .finish()
    }
}

#[derive(Debug)]
pub enum Dependency {
    Task { task: AsyncTask, strong: bool },
    Interlock(Arc<dyn Interlock>),
    Custom(CustomDep),
}

impl fmt::Debug for dyn Interlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<interlock>")
    }
}

impl Dependency {
    /// Wait bits this dependency occupies when it can be counted up front.
    pub(crate) fn static_bits(&self) -> usize {
        match self {
            Dependency::Task { .. } | Dependency::Custom(_) => 1,
            Dependency::Interlock(_) => 0,
        }
    }
}

impl From<AsyncTask> for Dependency {
    fn from(task: AsyncTask) -> Self {
        Dependency::Task { task, strong: true }
    }
}

impl From<&AsyncTask> for Dependency {
    fn from(task: &AsyncTask) -> Self {
        task.clone().into()
    }
}

impl From<WeakDep> for Dependency {
    fn from(dep: WeakDep) -> Self {
        Dependency::Task {
            task: dep.0,
            strong: false,
        }
    }
}

impl From<StrongDep> for Dependency {
    fn from(dep: StrongDep) -> Self {
        Dependency::Task {
            task: dep.0,
            strong: true,
        }
    }
}

impl From<InterlockDep> for Dependency {
    fn from(dep: InterlockDep) -> Self {
        Dependency::Interlock(dep.0)
    }
}

impl From<CustomDep> for Dependency {
    fn from(dep: CustomDep) -> Self {
        Dependency::Custom(dep)
    }
}

/// Anything that expands into a list of [`Dependency`].
pub trait IntoDeps {
    fn collect_into(self, out: &mut Dependencies);

    fn into_deps(self) -> Dependencies
    where
        Self: Sized,
    {
        let mut out = Dependencies::new();
        self.collect_into(&mut out);
        out
    }
}

macro_rules! impl_into_deps_single {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoDeps for $ty {
                fn collect_into(self, out: &mut Dependencies) {
                    out.push(self.into());
                }
            }
        )*
    };
}

impl_into_deps_single!(
    AsyncTask,
    &AsyncTask,
    WeakDep,
    StrongDep,
    InterlockDep,
    CustomDep,
    Dependency
);

impl IntoDeps for () {
    fn collect_into(self, _out: &mut Dependencies) {}
}

impl IntoDeps for WeakDeps {
    fn collect_into(self, out: &mut Dependencies) {
        out.extend(self.0.into_iter().map(|t| WeakDep(t).into()));
    }
}

impl IntoDeps for StrongDeps {
    fn collect_into(self, out: &mut Dependencies) {
        out.extend(self.0.into_iter().map(|t| StrongDep(t).into()));
    }
}

impl IntoDeps for Vec<Dependency> {
    fn collect_into(self, out: &mut Dependencies) {
        out.extend(self);
    }
}

impl IntoDeps for Dependencies {
    fn collect_into(self, out: &mut Dependencies) {
        out.extend(self);
    }
}

impl<D: IntoDeps> IntoDeps for Option<D> {
    fn collect_into(self, out: &mut Dependencies) {
        if let Some(deps) = self {
            deps.collect_into(out);
        }
    }
}

macro_rules! impl_into_deps_tuple {
    ($($name:ident),+) => {
        impl<$($name: IntoDeps),+> IntoDeps for ($($name,)+) {
            #[allow(non_snake_case)]
            fn collect_into(self, out: &mut Dependencies) {
                let ($($name,)+) = self;
                $($name.collect_into(out);)+
            }
        }
    };
}

impl_into_deps_tuple!(A);
impl_into_deps_tuple!(A, B);
impl_into_deps_tuple!(A, B, C);
impl_into_deps_tuple!(A, B, C, D);
impl_into_deps_tuple!(A, B, C, D, E);
impl_into_deps_tuple!(A, B, C, D, E, F);
impl_into_deps_tuple!(A, B, C, D, E, F, G);
impl_into_deps_tuple!(A, B, C, D, E, F, G, H);
