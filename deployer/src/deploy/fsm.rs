//! Finite State Machine for deployment records

use std::fmt;

use crate::errors::DeployError;
use crate::models::deployment::DeploymentStatus;

/// Deployment event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    /// Remote build requested
    BuildStarted,

    /// Build artifact is available
    ArtifactReady,

    /// Processing lock acquired, files are about to change
    ProcessingStarted,

    /// Files placed successfully
    Succeeded,

    /// Terminal failure at any active stage
    Failed(String),

    /// User cancelled
    Cancel,

    /// A newer commit replaces this deployment
    Supersede,

    /// Backup restored over the live directory
    RollBack,
}

impl fmt::Display for DeploymentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentEvent::BuildStarted => "build_started",
            DeploymentEvent::ArtifactReady => "artifact_ready",
            DeploymentEvent::ProcessingStarted => "processing_started",
            DeploymentEvent::Succeeded => "succeeded",
            DeploymentEvent::Failed(_) => "failed",
            DeploymentEvent::Cancel => "cancel",
            DeploymentEvent::Supersede => "supersede",
            DeploymentEvent::RollBack => "rollback",
        };
        f.write_str(name)
    }
}

/// Compute the next status, or an `InvalidTransition` error
pub fn next_status(
    from: DeploymentStatus,
    event: &DeploymentEvent,
) -> Result<DeploymentStatus, DeployError> {
    use DeploymentEvent as E;
    use DeploymentStatus as S;

    let to = match (from, event) {
        (S::Pending, E::BuildStarted) => S::Building,
        (S::Building, E::ArtifactReady) => S::Queued,

        // Direct retrieval skips building/queued
        (S::Pending, E::ProcessingStarted) => S::Deploying,
        (S::Queued, E::ProcessingStarted) => S::Deploying,

        (S::Deploying, E::Succeeded) => S::Success,

        (S::Pending | S::Building | S::Queued | S::Deploying, E::Failed(_)) => S::Failed,

        (S::Pending | S::Building, E::Cancel) => S::Cancelled,
        (S::Pending | S::Building | S::Queued, E::Supersede) => S::Cancelled,

        (S::Success, E::RollBack) => S::RolledBack,

        (from, event) => {
            return Err(DeployError::InvalidTransition {
                from,
                event: event.to_string(),
            });
        }
    };

    Ok(to)
}
