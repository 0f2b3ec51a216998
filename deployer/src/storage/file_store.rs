//! JSON file backed deployment store

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::models::deployment::{DeploymentLock, DeploymentPatch, DeploymentRecord};
use crate::storage::store::{DeploymentFilter, DeploymentStore, LockAcquire, StoreState};

/// Deployment store persisted to a single JSON document.
///
/// Every mutation rewrites the file atomically, so records and the lock
/// survive restarts of the deployer.
pub struct FileStore {
    file: File,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open the store, creating an empty one if the file does not exist
    pub async fn open(file: File) -> Result<Self, DeployError> {
        let state = if file.exists().await {
            file.read_json::<StoreState>().await.map_err(|e| {
                DeployError::StorageError(format!(
                    "cannot read store {}: {}",
                    file.path().display(),
                    e
                ))
            })?
        } else {
            StoreState::default()
        };

        info!(
            "Opened deployment store {} ({} records)",
            file.path().display(),
            state.records.len()
        );

        Ok(Self {
            file,
            state: Mutex::new(state),
        })
    }

    /// Apply `change` to a copy of the state, write it, and only then make it
    /// current. A failed write leaves memory as it was.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut StoreState) -> Result<(T, bool), DeployError>,
    ) -> Result<T, DeployError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let (value, changed) = change(&mut next)?;
        if changed {
            self.persist(&next).await?;
            *state = next;
        }
        Ok(value)
    }

    async fn persist(&self, state: &StoreState) -> Result<(), DeployError> {
        let contents = serde_json::to_vec_pretty(state)?;
        self.file.write_atomic(&contents).await?;
        debug!("Persisted deployment store to {}", self.file.path().display());
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for FileStore {
    async fn insert(&self, record: &DeploymentRecord) -> Result<String, DeployError> {
        self.mutate(|state| Ok((state.insert(record)?, true))).await
    }

    async fn update(
        &self,
        id: &str,
        patch: DeploymentPatch,
    ) -> Result<DeploymentRecord, DeployError> {
        self.mutate(|state| Ok((state.update(id, patch)?, true))).await
    }

    async fn get(&self, id: &str) -> Result<Option<DeploymentRecord>, DeployError> {
        Ok(self.state.lock().await.records.get(id).cloned())
    }

    async fn get_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<DeploymentRecord>, DeployError> {
        Ok(self.state.lock().await.get_by_correlation(correlation_id))
    }

    async fn get_by_commit(
        &self,
        site: &str,
        sha: &str,
    ) -> Result<Option<DeploymentRecord>, DeployError> {
        Ok(self.state.lock().await.get_by_commit(site, sha))
    }

    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<DeploymentRecord>, DeployError> {
        Ok(self.state.lock().await.list(filter))
    }

    async fn lock_acquire(
        &self,
        site: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockAcquire, DeployError> {
        self.mutate(|state| {
            let result = state.lock_acquire(site, holder, ttl);
            let acquired = matches!(result, LockAcquire::Acquired(_));
            Ok((result, acquired))
        })
        .await
    }

    async fn lock_read(&self, site: &str) -> Result<Option<DeploymentLock>, DeployError> {
        Ok(self.state.lock().await.locks.get(site).cloned())
    }

    async fn lock_release(&self, site: &str, holder: &str) -> Result<bool, DeployError> {
        self.mutate(|state| {
            let released = state.lock_release(site, holder);
            Ok((released, released))
        })
        .await
    }
}
