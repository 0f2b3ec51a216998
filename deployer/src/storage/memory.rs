//! In-memory deployment store

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::DeployError;
use crate::models::deployment::{DeploymentLock, DeploymentPatch, DeploymentRecord};
use crate::storage::store::{DeploymentFilter, DeploymentStore, LockAcquire, StoreState};

/// In-memory deployment store.
///
/// Data is lost when the process exits; used by tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreState>, DeployError> {
        self.state
            .read()
            .map_err(|_| DeployError::StorageError("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StoreState>, DeployError> {
        self.state
            .write()
            .map_err(|_| DeployError::StorageError("lock poisoned".to_string()))
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, record: &DeploymentRecord) -> Result<String, DeployError> {
        self.write()?.insert(record)
    }

    async fn update(
        &self,
        id: &str,
        patch: DeploymentPatch,
    ) -> Result<DeploymentRecord, DeployError> {
        self.write()?.update(id, patch)
    }

    async fn get(&self, id: &str) -> Result<Option<DeploymentRecord>, DeployError> {
        Ok(self.read()?.records.get(id).cloned())
    }

    async fn get_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<DeploymentRecord>, DeployError> {
        Ok(self.read()?.get_by_correlation(correlation_id))
    }

    async fn get_by_commit(
        &self,
        site: &str,
        sha: &str,
    ) -> Result<Option<DeploymentRecord>, DeployError> {
        Ok(self.read()?.get_by_commit(site, sha))
    }

    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<DeploymentRecord>, DeployError> {
        Ok(self.read()?.list(filter))
    }

    async fn lock_acquire(
        &self,
        site: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockAcquire, DeployError> {
        Ok(self.write()?.lock_acquire(site, holder, ttl))
    }

    async fn lock_read(&self, site: &str) -> Result<Option<DeploymentLock>, DeployError> {
        Ok(self.read()?.locks.get(site).cloned())
    }

    async fn lock_release(&self, site: &str, holder: &str) -> Result<bool, DeployError> {
        Ok(self.write()?.lock_release(site, holder))
    }
}
