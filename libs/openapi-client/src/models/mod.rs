//! API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A CI workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    pub head_sha: String,
    #[serde(default)]
    pub head_branch: Option<String>,
    /// queued, in_progress, completed, ...
    #[serde(default)]
    pub status: Option<String>,
    /// success, failure, cancelled, timed_out, ...
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Workflow run list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunList {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub workflow_runs: Vec<WorkflowRun>,
}

/// A build artifact attached to a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub size_in_bytes: u64,
    #[serde(default)]
    pub archive_download_url: Option<String>,
    #[serde(default)]
    pub expired: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Artifact listing as returned by the provider or the relay.
///
/// The provider wraps the list in an object, the relay sometimes forwards a
/// bare array or a single artifact object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArtifactListResponse {
    Wrapped {
        #[serde(default)]
        total_count: Option<u64>,
        artifacts: Vec<Artifact>,
    },
    Bare(Vec<Artifact>),
    Single(Artifact),
}

impl ArtifactListResponse {
    /// Flatten into a plain list, dropping expired artifacts
    pub fn into_artifacts(self) -> Vec<Artifact> {
        let artifacts = match self {
            ArtifactListResponse::Wrapped { artifacts, .. } => artifacts,
            ArtifactListResponse::Bare(artifacts) => artifacts,
            ArtifactListResponse::Single(artifact) => vec![artifact],
        };
        artifacts.into_iter().filter(|a| !a.expired).collect()
    }
}

/// Workflow dispatch request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDispatchRequest {
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub inputs: serde_json::Map<String, serde_json::Value>,
}

/// Deployment outcome reported to the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeReportRequest {
    pub deployment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}
