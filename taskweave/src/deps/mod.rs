//! Pluggable resolution of dependencies that are not tasks.
//!
//! A [`DependencyManager`] registered for a type `T` receives every
//! [`CustomDep`] built from a `T`. It reserves one or more wait bits on the
//! dependent task and clears them, through [`set_dependency_completion`], once
//! whatever it tracks has happened.

use crate::error::SchedulerError;
use crate::scheduler::Scheduler;
use crate::task::{AsyncTask, CustomDep, MAX_DEPENDENCIES};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

mod event;
pub use event::{EventDep, EventDependencyManager, ManualEvent};

pub trait DependencyManager: Send + Sync + 'static {
    /// Takes over `dep` on behalf of `task`.
    ///
    /// Bits are reserved with [`next_wait_bit`], which advances `bit_index`.
    /// Returning an error aborts the enqueue of `task`.
    fn resolve(
        &self,
        scheduler: &Scheduler,
        dep: CustomDep,
        task: &AsyncTask,
        bit_index: &mut u32,
    ) -> Result<(), SchedulerError>;
}

/// Reserves the next wait bit of the task being enqueued.
pub fn next_wait_bit(bit_index: &mut u32) -> Result<u32, SchedulerError> {
    let bit = *bit_index;

    if bit as usize >= MAX_DEPENDENCIES {
        return Err(SchedulerError::TooManyDependencies {
            requested: bit as usize + 1,
            max: MAX_DEPENDENCIES,
        });
    }

    *bit_index += 1;
    Ok(bit)
}

/// Marks the dependency behind `bit` as resolved. With `canceled` set the
/// dependent is canceled, exactly as if a strong predecessor was canceled.
pub fn set_dependency_completion(task: &AsyncTask, bit: u32, canceled: bool) {
    task.0.complete_dependency(bit, canceled);
}

/// Maps dependency argument types to their manager.
#[derive(Default)]
pub(crate) struct ManagerRegistry {
    managers: RwLock<HashMap<TypeId, Arc<dyn DependencyManager>>>,
}

impl ManagerRegistry {
    /// Returns false if a manager is already registered for `T`.
    pub(crate) fn register<T: Any>(&self, manager: Arc<dyn DependencyManager>) -> bool {
        let mut managers = self.managers.write();

        if managers.contains_key(&TypeId::of::<T>()) {
            return false;
        }

        debug!(dep_type = std::any::type_name::<T>(), "dependency manager registered");
        managers.insert(TypeId::of::<T>(), manager);
        true
    }

    pub(crate) fn unregister<T: Any>(&self) -> bool {
        self.managers.write().remove(&TypeId::of::<T>()).is_some()
    }

    pub(crate) fn get(&self, type_id: TypeId) -> Option<Arc<dyn DependencyManager>> {
        self.managers.read().get(&type_id).cloned()
    }

    pub(crate) fn clear(&self) {
        self.managers.write().clear();
    }
}

impl fmt::Debug for ManagerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerRegistry")
            .field("managers", &self.managers.read().len())
            .finish()
    }
}
