//! Remote build and artifact retrieval.
//!
//! The orchestrator only talks to the CI provider through [`Retrieval`], so
//! tests can swap in a scripted implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::diagnostics::FailureContext;
use crate::errors::DeployError;
use crate::models::deployment::ArtifactDescriptor;

/// Tolerated drift between our clock and the provider's when comparing run
/// creation times
pub const RUN_CLOCK_SKEW_SECS: i64 = 30;

/// Result of asking the provider to build a commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerOutcome {
    /// Run id when the provider could bind one synchronously
    pub correlation_id: Option<String>,
    pub build_url: Option<String>,
}

/// Coarse run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    InProgress,
    Completed,
}

/// Status of a remote run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatus {
    pub correlation_id: String,
    pub state: RunState,

    /// Provider conclusion, kept verbatim
    pub conclusion: Option<String>,
    pub url: Option<String>,
    pub head_sha: Option<String>,

    /// When the provider created the run, if it says
    pub created_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn succeeded(&self) -> bool {
        self.is_terminal() && self.conclusion.as_deref() == Some("success")
    }

    pub fn is_for_commit(&self, sha: &str) -> bool {
        self.head_sha
            .as_deref()
            .map(|head| head.eq_ignore_ascii_case(sha))
            .unwrap_or(false)
    }

    /// Whether the run could have been started at or after `since`. Runs
    /// without a creation time are given the benefit of the doubt.
    pub fn created_since(&self, since: DateTime<Utc>) -> bool {
        self.created_at
            .map(|created| created >= since - Duration::seconds(RUN_CLOCK_SKEW_SECS))
            .unwrap_or(true)
    }
}

/// Deployment outcome sent upstream
#[derive(Debug, Clone)]
pub struct OutcomeReport {
    pub deployment_id: String,
    pub correlation_id: Option<String>,
    pub success: bool,
    pub message: Option<String>,
    pub logs: Option<String>,
    pub context: Option<FailureContext>,
}

/// CI provider operations used by the orchestrator
#[async_trait]
pub trait Retrieval: Send + Sync {
    /// Request a build of `sha` on `branch`
    async fn trigger_build(&self, branch: &str, sha: &str) -> Result<TriggerOutcome, DeployError>;

    async fn poll_status(&self, correlation_id: &str) -> Result<RunStatus, DeployError>;

    /// Most recent runs, newest first
    async fn list_recent_runs(&self, limit: u32) -> Result<Vec<RunStatus>, DeployError>;

    async fn list_artifacts(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<ArtifactDescriptor>, DeployError>;

    /// Download an artifact archive to `dest`, returning its size
    async fn fetch_artifact(
        &self,
        artifact: &ArtifactDescriptor,
        dest: &Path,
    ) -> Result<u64, DeployError>;

    /// Download a source snapshot of `git_ref` (or `url` when the event
    /// supplied one) to `dest`, returning its size
    async fn fetch_source_snapshot(
        &self,
        git_ref: &str,
        url: Option<&str>,
        dest: &Path,
    ) -> Result<u64, DeployError>;

    /// Best-effort cancel of a remote run
    async fn cancel(&self, correlation_id: &str) -> Result<(), DeployError>;

    async fn report_outcome(&self, report: &OutcomeReport) -> Result<(), DeployError>;
}
