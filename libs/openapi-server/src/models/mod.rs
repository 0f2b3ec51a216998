//! Deployer API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Acknowledgement returned to webhook senders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
}

/// Manual deployment trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub commit_sha: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
}

/// Body for approve / cancel / rollback
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub actor: Option<String>,
}

/// Deployment as exposed over the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub id: String,
    pub commit_sha: String,
    #[serde(default)]
    pub commit_message: Option<String>,
    pub status: String,
    pub trigger: String,
    pub triggered_by: String,
    pub method: String,
    pub requires_approval: bool,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub build_url: Option<String>,
    #[serde(default)]
    pub backup_path: Option<String>,
    #[serde(default)]
    pub file_count: usize,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_point: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deployed_at: Option<DateTime<Utc>>,
}

/// Single deployment response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentSummary>,
    /// Present on conflicts: the record blocking the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_deployment: Option<DeploymentSummary>,
}

/// Deployment detail including the log text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentDetailResponse {
    pub deployment: DeploymentSummary,
    pub files: Vec<String>,
    pub log: String,
}

/// Deployment list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentListResponse {
    pub deployments: Vec<DeploymentSummary>,
    pub total: usize,
}

/// Polling sweep result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepResponse {
    pub checked: usize,
    pub advanced: usize,
    pub failed: usize,
    pub recovered: usize,
}
