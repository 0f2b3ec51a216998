//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use openapi_server::models::{
    ActionRequest, DeploymentDetailResponse, DeploymentListResponse, DeploymentResponse,
    DeploymentSummary, HealthResponse, SweepResponse, TriggerRequest, VersionResponse,
    WebhookResponse,
};
use serde::Deserialize;
use tracing::{error, warn};

use crate::deploy::orchestrator::{continuation_for, StartOutcome};
use crate::errors::DeployError;
use crate::models::deployment::{CommitInfo, DeploymentRecord, StartRequest, TriggerType};
use crate::server::state::ServerState;
use crate::tasks::queue::TaskKind;
use crate::utils::version_info;
use crate::webhook::events::EventHeaders;
use crate::webhook::ingress::WebhookRequest;

pub const SIGNATURE_HEADERS: [&str; 2] = ["x-hub-signature-256", "x-signature-256"];
pub const RELAY_EVENT_HEADER: &str = "x-relay-event";
pub const PROVIDER_EVENT_HEADER: &str = "x-github-event";
pub const FORWARDED_HEADER: &str = "x-relay-forwarded";

const DEFAULT_LIST_LIMIT: usize = 50;

pub fn summary(record: &DeploymentRecord) -> DeploymentSummary {
    DeploymentSummary {
        id: record.id.clone(),
        commit_sha: record.commit.sha.clone(),
        commit_message: record.commit.message.clone(),
        status: record.status.to_string(),
        trigger: record.trigger.to_string(),
        triggered_by: record.triggered_by.clone(),
        method: record.method.to_string(),
        requires_approval: record.requires_approval,
        run_id: record.correlation_id.clone(),
        build_url: record.build_url.clone(),
        backup_path: record
            .backup_path
            .as_ref()
            .map(|p| p.display().to_string()),
        file_count: record.files.len(),
        error: record.error.clone(),
        failure_point: record.failure_point.map(|p| p.to_string()),
        created_at: record.created_at,
        updated_at: record.updated_at,
        deployed_at: record.deployed_at,
    }
}

/// Error response for the deployment API
pub struct ApiError(DeployError);

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let blocking_deployment = match &self.0 {
            DeployError::Conflict(record) => Some(summary(record)),
            _ => None,
        };
        let body = DeploymentResponse {
            success: false,
            message: self.0.to_string(),
            deployment: None,
            blocking_deployment,
        };
        (status, Json(body)).into_response()
    }
}

fn deployment_response(message: impl Into<String>, record: &DeploymentRecord) -> Json<DeploymentResponse> {
    Json(DeploymentResponse {
        success: true,
        message: message.into(),
        deployment: Some(summary(record)),
        blocking_deployment: None,
    })
}

async fn continue_with(state: &Arc<ServerState>, kind: TaskKind) -> Result<(), DeployError> {
    state
        .orchestrator
        .dispatch(kind, state.inline_continuation)
        .await
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deployer".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Inbound webhook handler. Acknowledges before any long-running work.
pub async fn webhook_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = SIGNATURE_HEADERS
        .iter()
        .find_map(|name| header(&headers, name));
    let forwarded = header(&headers, FORWARDED_HEADER)
        .map(|v| !matches!(v.trim(), "" | "0" | "false"))
        .unwrap_or(false);

    let request = WebhookRequest {
        body: &body,
        signature,
        headers: EventHeaders {
            relay_event: header(&headers, RELAY_EVENT_HEADER).map(str::to_string),
            provider_event: header(&headers, PROVIDER_EVENT_HEADER).map(str::to_string),
            content_type: header(&headers, "content-type").map(str::to_string),
        },
        forwarded,
    };

    let result = match state.ingress.handle(request).await {
        Ok(outcome) => match outcome.continuation.clone() {
            Some(kind) => continue_with(&state, kind).await.map(|_| outcome),
            None => Ok(outcome),
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(outcome) => (
            StatusCode::OK,
            Json(WebhookResponse {
                success: true,
                message: outcome.message,
                deployment_id: outcome.deployment_id,
            }),
        )
            .into_response(),
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() {
                error!("Webhook handling failed: {}", e);
            } else {
                warn!("Webhook rejected ({}): {}", status, e);
            }
            (
                status,
                Json(WebhookResponse {
                    success: false,
                    message: e.to_string(),
                    deployment_id: None,
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

/// Deployment list handler
pub async fn list_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<DeploymentListResponse>, ApiError> {
    let records = state
        .orchestrator
        .list(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    let deployments: Vec<DeploymentSummary> = records.iter().map(summary).collect();
    let total = deployments.len();
    Ok(Json(DeploymentListResponse { deployments, total }))
}

/// Deployment detail handler
pub async fn deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentDetailResponse>, ApiError> {
    let record = state.orchestrator.get(&id).await?;
    Ok(Json(DeploymentDetailResponse {
        deployment: summary(&record),
        files: record.files.clone(),
        log: record.log,
    }))
}

/// Manual trigger handler
pub async fn trigger_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<TriggerRequest>,
) -> Result<Response, ApiError> {
    if request.commit_sha.trim().is_empty() {
        return Err(DeployError::MalformedEvent("commit_sha is required".to_string()).into());
    }

    let commit = CommitInfo {
        sha: request.commit_sha.trim().to_string(),
        message: request.message,
        author: request.author,
        timestamp: None,
    };
    let actor = request.actor.unwrap_or_else(|| "api".to_string());
    let outcome = state
        .orchestrator
        .start(StartRequest::new(commit, TriggerType::Manual, actor))
        .await?;

    if let StartOutcome::Started(record) = &outcome {
        if let Some(kind) = continuation_for(record) {
            continue_with(&state, kind).await?;
        }
    }

    let message = match &outcome {
        StartOutcome::Started(_) => "deployment started",
        StartOutcome::Existing(_) => "deployment already exists",
        StartOutcome::AwaitingApproval(_) => "deployment awaiting approval",
        StartOutcome::Deferred { .. } => "deployment deferred",
    };
    let status = match &outcome {
        StartOutcome::Started(_) | StartOutcome::AwaitingApproval(_) => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    Ok((status, deployment_response(message, outcome.record())).into_response())
}

fn actor(body: Option<Json<ActionRequest>>) -> String {
    body.and_then(|Json(b)| b.actor)
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| "api".to_string())
}

/// Approve handler
pub async fn approve_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Option<Json<ActionRequest>>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let record = state.orchestrator.approve(&id, &actor(body)).await?;
    if let Some(kind) = continuation_for(&record) {
        continue_with(&state, kind).await?;
    }
    Ok(deployment_response("deployment approved", &record))
}

/// Cancel handler
pub async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Option<Json<ActionRequest>>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let record = state.orchestrator.cancel(&id, &actor(body)).await?;
    Ok(deployment_response("deployment cancelled", &record))
}

/// Rollback handler
pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Option<Json<ActionRequest>>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let record = state.orchestrator.rollback(&id, &actor(body)).await?;
    Ok(deployment_response("deployment rolled back", &record))
}

/// Polling sweep handler
pub async fn poll_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<SweepResponse>, ApiError> {
    let report = state.orchestrator.poll_sweep().await?;
    Ok(Json(SweepResponse {
        checked: report.checked,
        advanced: report.advanced,
        failed: report.failed,
        recovered: report.recovered,
    }))
}
