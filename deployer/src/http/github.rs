//! GitHub Actions retrieval

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openapi_client::models::{
    ArtifactListResponse, OutcomeReportRequest, WorkflowDispatchRequest, WorkflowRun,
    WorkflowRunList,
};
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::http::client::HttpClient;
use crate::models::deployment::ArtifactDescriptor;
use crate::retrieval::{OutcomeReport, Retrieval, RunState, RunStatus, TriggerOutcome};

/// GitHub retrieval options
#[derive(Debug, Clone)]
pub struct Options {
    /// Workflow file dispatched for builds
    pub workflow: String,

    /// Attempts made to find the run created by a dispatch
    pub dispatch_lookup_attempts: u32,

    /// Delay between dispatch lookups
    pub dispatch_lookup_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workflow: "build-theme.yml".to_string(),
            dispatch_lookup_attempts: 3,
            dispatch_lookup_delay: Duration::from_secs(2),
        }
    }
}

/// Retrieval backed by the GitHub REST API and an optional outcome relay
pub struct GithubRetrieval {
    api: HttpClient,
    relay: Option<HttpClient>,
    owner: String,
    repo: String,
    options: Options,
}

impl GithubRetrieval {
    pub fn new(
        api_url: &str,
        token: Option<SecretString>,
        owner: &str,
        repo: &str,
        relay: Option<(String, Option<SecretString>)>,
        options: Options,
    ) -> Result<Self, DeployError> {
        let api = HttpClient::new(api_url, token)?;
        let relay = match relay {
            Some((url, token)) => Some(HttpClient::new(&url, token)?),
            None => None,
        };

        Ok(Self {
            api,
            relay,
            owner: owner.to_string(),
            repo: repo.to_string(),
            options,
        })
    }

    fn repo_path(&self, suffix: &str) -> String {
        format!("/repos/{}/{}{}", self.owner, self.repo, suffix)
    }

    /// Find the run created by a dispatch of `sha` at `dispatched_at`,
    /// polling a bounded number of times. Earlier runs of the same commit and
    /// runs that already completed are never bound.
    async fn find_dispatched_run(
        &self,
        branch: &str,
        sha: &str,
        dispatched_at: DateTime<Utc>,
    ) -> Option<WorkflowRun> {
        let path = self.repo_path(&format!(
            "/actions/runs?branch={}&event=workflow_dispatch&per_page=10",
            branch
        ));

        for attempt in 0..self.options.dispatch_lookup_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.options.dispatch_lookup_delay).await;
            }
            match self.api.get::<WorkflowRunList>(&path).await {
                Ok(list) => {
                    if let Some(run) = list.workflow_runs.into_iter().find(|run| {
                        let status = run_status(run);
                        status.is_for_commit(sha)
                            && !status.is_terminal()
                            && status.created_since(dispatched_at)
                    }) {
                        return Some(run);
                    }
                }
                Err(e) => warn!("Dispatch lookup failed: {}", e),
            }
        }
        None
    }
}

fn run_status(run: &WorkflowRun) -> RunStatus {
    let state = match run.status.as_deref() {
        Some("completed") => RunState::Completed,
        Some("in_progress") => RunState::InProgress,
        _ => RunState::Queued,
    };
    RunStatus {
        correlation_id: run.id.to_string(),
        state,
        conclusion: run.conclusion.clone(),
        url: run.html_url.clone(),
        head_sha: Some(run.head_sha.clone()),
        created_at: run.created_at,
    }
}

#[async_trait]
impl Retrieval for GithubRetrieval {
    async fn trigger_build(&self, branch: &str, sha: &str) -> Result<TriggerOutcome, DeployError> {
        let mut inputs = serde_json::Map::new();
        inputs.insert("commit_sha".to_string(), serde_json::Value::from(sha));
        let body = WorkflowDispatchRequest {
            git_ref: branch.to_string(),
            inputs,
        };

        let path = self.repo_path(&format!(
            "/actions/workflows/{}/dispatches",
            self.options.workflow
        ));
        let dispatched_at = Utc::now();
        self.api
            .post(&path, &body)
            .await
            .map_err(|e| DeployError::RemoteTrigger(e.to_string()))?;
        info!("Dispatched workflow {} for {}", self.options.workflow, sha);

        Ok(match self.find_dispatched_run(branch, sha, dispatched_at).await {
            Some(run) => TriggerOutcome {
                correlation_id: Some(run.id.to_string()),
                build_url: run.html_url,
            },
            None => {
                debug!("No run bound yet for {}", sha);
                TriggerOutcome::default()
            }
        })
    }

    async fn poll_status(&self, correlation_id: &str) -> Result<RunStatus, DeployError> {
        let path = self.repo_path(&format!("/actions/runs/{}", correlation_id));
        let run: WorkflowRun = self.api.get(&path).await?;
        Ok(run_status(&run))
    }

    async fn list_recent_runs(&self, limit: u32) -> Result<Vec<RunStatus>, DeployError> {
        let path = self.repo_path(&format!("/actions/runs?per_page={}", limit));
        let list: WorkflowRunList = self.api.get(&path).await?;
        Ok(list.workflow_runs.iter().map(run_status).collect())
    }

    async fn list_artifacts(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<ArtifactDescriptor>, DeployError> {
        let path = self.repo_path(&format!("/actions/runs/{}/artifacts", correlation_id));
        let list: ArtifactListResponse = self.api.get(&path).await?;

        Ok(list
            .into_artifacts()
            .into_iter()
            .map(|artifact| ArtifactDescriptor {
                id: Some(artifact.id),
                name: artifact.name,
                size_in_bytes: Some(artifact.size_in_bytes),
                download_url: None,
                expires_at: artifact.expires_at,
            })
            .collect())
    }

    async fn fetch_artifact(
        &self,
        artifact: &ArtifactDescriptor,
        dest: &Path,
    ) -> Result<u64, DeployError> {
        let result = match (&artifact.download_url, artifact.id) {
            (Some(url), _) if artifact.has_signed_url() => self.api.download(url, dest, false).await,
            (_, Some(id)) => {
                let path = self.repo_path(&format!("/actions/artifacts/{}/zip", id));
                self.api.download(&path, dest, true).await
            }
            _ => {
                return Err(DeployError::ArtifactNotFound(format!(
                    "artifact {} has no usable download reference",
                    artifact.name
                )))
            }
        };

        result.map_err(|e| DeployError::ArtifactDownload(format!("{}: {}", artifact.name, e)))
    }

    async fn fetch_source_snapshot(
        &self,
        git_ref: &str,
        url: Option<&str>,
        dest: &Path,
    ) -> Result<u64, DeployError> {
        let result = match url {
            Some(url) => self.api.download(url, dest, false).await,
            None => {
                let path = self.repo_path(&format!("/tarball/{}", git_ref));
                self.api.download(&path, dest, true).await
            }
        };

        result.map_err(|e| DeployError::ArtifactDownload(format!("snapshot {}: {}", git_ref, e)))
    }

    async fn cancel(&self, correlation_id: &str) -> Result<(), DeployError> {
        let path = self.repo_path(&format!("/actions/runs/{}/cancel", correlation_id));
        self.api.post_empty(&path).await
    }

    async fn report_outcome(&self, report: &OutcomeReport) -> Result<(), DeployError> {
        let Some(relay) = &self.relay else {
            debug!("No relay configured, skipping outcome report");
            return Ok(());
        };

        let body = OutcomeReportRequest {
            deployment_id: report.deployment_id.clone(),
            run_id: report.correlation_id.clone(),
            success: report.success,
            message: report.message.clone(),
            logs: report.logs.clone(),
            context: report
                .context
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        };
        relay.post("", &body).await
    }
}
