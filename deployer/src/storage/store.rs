//! Deployment record store

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::models::deployment::{
    DeploymentLock, DeploymentPatch, DeploymentRecord, DeploymentStatus,
};

/// Filter criteria for listing deployments
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    pub site: Option<String>,
    pub active_only: bool,
    pub status: Option<DeploymentStatus>,
    pub limit: Option<usize>,
}

impl DeploymentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, record: &DeploymentRecord) -> bool {
        if let Some(site) = &self.site {
            if &record.site != site {
                return false;
            }
        }
        if self.active_only && !record.status.is_active() {
            return false;
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        true
    }
}

/// Result of a lock acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquire {
    Acquired(DeploymentLock),

    /// Someone holds a live lock (possibly the same holder)
    Held(DeploymentLock),
}

/// Backend for deployment records and the advisory processing lock.
///
/// Records are keyed by id; the store does not enforce the single-active
/// invariant, the orchestrator does.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new record, returning its id
    async fn insert(&self, record: &DeploymentRecord) -> Result<String, DeployError>;

    /// Apply a partial update. Fails with `StaleRecord` when the patch
    /// carries an expected status that no longer matches.
    async fn update(&self, id: &str, patch: DeploymentPatch)
        -> Result<DeploymentRecord, DeployError>;

    async fn get(&self, id: &str) -> Result<Option<DeploymentRecord>, DeployError>;

    /// Newest record bound to a remote run id
    async fn get_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<DeploymentRecord>, DeployError>;

    /// Newest record for a commit
    async fn get_by_commit(
        &self,
        site: &str,
        sha: &str,
    ) -> Result<Option<DeploymentRecord>, DeployError>;

    /// Records matching the filter, newest first
    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<DeploymentRecord>, DeployError>;

    /// Try to take the site lock without blocking. Expired locks are taken
    /// over.
    async fn lock_acquire(
        &self,
        site: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockAcquire, DeployError>;

    /// Current lock, including expired ones
    async fn lock_read(&self, site: &str) -> Result<Option<DeploymentLock>, DeployError>;

    /// Release the lock if `holder` owns it. Returns whether a lock was removed.
    async fn lock_release(&self, site: &str, holder: &str) -> Result<bool, DeployError>;
}

/// Plain store contents shared by the memory and file backends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub records: HashMap<String, DeploymentRecord>,

    #[serde(default)]
    pub locks: HashMap<String, DeploymentLock>,
}

impl StoreState {
    pub fn insert(&mut self, record: &DeploymentRecord) -> Result<String, DeployError> {
        if self.records.contains_key(&record.id) {
            return Err(DeployError::StorageError(format!(
                "deployment {} already exists",
                record.id
            )));
        }
        self.records.insert(record.id.clone(), record.clone());
        Ok(record.id.clone())
    }

    pub fn update(
        &mut self,
        id: &str,
        patch: DeploymentPatch,
    ) -> Result<DeploymentRecord, DeployError> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| DeployError::NotFound(format!("deployment {id}")))?;

        if let Some(expected) = patch.expected_status {
            if record.status != expected {
                return Err(DeployError::StaleRecord {
                    id: id.to_string(),
                    expected,
                    actual: record.status,
                });
            }
        }

        patch.apply(record);
        Ok(record.clone())
    }

    fn newest<'a>(
        records: impl Iterator<Item = &'a DeploymentRecord>,
    ) -> Option<DeploymentRecord> {
        records.max_by_key(|r| r.created_at).cloned()
    }

    pub fn get_by_correlation(&self, correlation_id: &str) -> Option<DeploymentRecord> {
        Self::newest(
            self.records
                .values()
                .filter(|r| r.correlation_id.as_deref() == Some(correlation_id)),
        )
    }

    pub fn get_by_commit(&self, site: &str, sha: &str) -> Option<DeploymentRecord> {
        Self::newest(
            self.records
                .values()
                .filter(|r| r.site == site && r.commit.sha.eq_ignore_ascii_case(sha)),
        )
    }

    pub fn list(&self, filter: &DeploymentFilter) -> Vec<DeploymentRecord> {
        let mut results: Vec<_> = self
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        results
    }

    pub fn lock_acquire(&mut self, site: &str, holder: &str, ttl: Duration) -> LockAcquire {
        let now = Utc::now();
        if let Some(existing) = self.locks.get(site) {
            if !existing.is_expired(now) {
                return LockAcquire::Held(existing.clone());
            }
            tracing::warn!(
                "Taking over expired deployment lock for site {} from {}",
                site,
                existing.holder
            );
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));
        let lock = DeploymentLock {
            site: site.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        self.locks.insert(site.to_string(), lock.clone());
        LockAcquire::Acquired(lock)
    }

    pub fn lock_release(&mut self, site: &str, holder: &str) -> bool {
        match self.locks.get(site) {
            Some(lock) if lock.holder == holder => {
                self.locks.remove(site);
                true
            }
            _ => false,
        }
    }
}
