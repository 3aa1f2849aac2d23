use super::ImportError;
use crate::model::ImportId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Registry = Arc<Mutex<HashMap<ImportId, Arc<AsyncMutex<()>>>>>;

/// Per-import exclusive leases; at most one pipeline run holds an import at a time.
#[derive(Clone, Default)]
pub struct ImportLocks {
    registry: Registry,
}

/// Exclusive hold on one import. Released on drop.
pub struct ImportLease {
    id: ImportId,
    registry: Registry,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ImportLocks {
    /// Take the lease for `id`, or fail with [`ImportError::AlreadyRunning`].
    pub fn try_acquire(&self, id: ImportId) -> Result<ImportLease, ImportError> {
        let guard = self
            .entry(id)
            .try_lock_owned()
            .map_err(|_| ImportError::AlreadyRunning(id))?;
        Ok(self.lease(id, guard))
    }

    /// Wait until the lease for `id` is free and take it.
    pub async fn acquire(&self, id: ImportId) -> ImportLease {
        let guard = self.entry(id).lock_owned().await;
        self.lease(id, guard)
    }

    /// Whether a lease for `id` is currently held.
    pub fn is_held(&self, id: ImportId) -> bool {
        lock_registry(&self.registry)
            .get(&id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    fn entry(&self, id: ImportId) -> Arc<AsyncMutex<()>> {
        Arc::clone(lock_registry(&self.registry).entry(id).or_default())
    }

    fn lease(&self, id: ImportId, guard: OwnedMutexGuard<()>) -> ImportLease {
        ImportLease {
            id,
            registry: Arc::clone(&self.registry),
            guard: Some(guard),
        }
    }
}

impl Drop for ImportLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut registry = lock_registry(&self.registry);
        // Only the registry's own handle left means nobody holds or awaits this lock.
        if registry
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            registry.remove(&self.id);
        }
    }
}

fn lock_registry(
    registry: &Registry,
) -> MutexGuard<'_, HashMap<ImportId, Arc<AsyncMutex<()>>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
