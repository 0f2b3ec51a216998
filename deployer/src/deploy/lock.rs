//! Scoped advisory processing lock

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::errors::DeployError;
use crate::models::deployment::DeploymentLock;
use crate::storage::store::{DeploymentStore, LockAcquire};

/// How a locked section ended
#[derive(Debug)]
pub enum LockOutcome<T> {
    /// The section ran to completion
    Completed(T),

    /// The lock was held; the section did not run
    Contended(DeploymentLock),

    /// The section panicked; the lock was still released
    Panicked(String),
}

/// Releases the lock if the holding future is dropped before finishing
struct ReleaseGuard {
    store: Arc<dyn DeploymentStore>,
    site: String,
    holder: String,
    armed: bool,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let site = std::mem::take(&mut self.site);
        let holder = std::mem::take(&mut self.holder);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Locked section for {} dropped, releasing lock", holder);
                handle.spawn(async move {
                    if let Err(e) = store.lock_release(&site, &holder).await {
                        error!("Failed to release lock for {}: {}", holder, e);
                    }
                });
            }
            Err(_) => warn!(
                "Locked section for {} dropped outside a runtime, lock expires by TTL",
                holder
            ),
        }
    }
}

/// Run `section` while holding the site lock.
///
/// Acquisition never blocks. The lock is released on every exit path:
/// normal return, error, panic, or the returned future being dropped.
pub async fn with_lock<T, F>(
    store: Arc<dyn DeploymentStore>,
    site: &str,
    holder: &str,
    ttl: Duration,
    section: F,
) -> Result<LockOutcome<T>, DeployError>
where
    F: Future<Output = T>,
{
    match store.lock_acquire(site, holder, ttl).await? {
        LockAcquire::Held(lock) => {
            debug!("Lock for site {} held by {}", site, lock.holder);
            return Ok(LockOutcome::Contended(lock));
        }
        LockAcquire::Acquired(lock) => {
            debug!("Lock for site {} acquired by {} until {}", site, holder, lock.expires_at);
        }
    }

    let mut guard = ReleaseGuard {
        store: store.clone(),
        site: site.to_string(),
        holder: holder.to_string(),
        armed: true,
    };

    let result = AssertUnwindSafe(section).catch_unwind().await;

    guard.armed = false;
    if let Err(e) = store.lock_release(site, holder).await {
        error!("Failed to release lock for site {}: {}", site, e);
    }

    Ok(match result {
        Ok(value) => LockOutcome::Completed(value),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Locked section for {} panicked: {}", holder, message);
            LockOutcome::Panicked(message)
        }
    })
}
