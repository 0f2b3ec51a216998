//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::orchestrator::Orchestrator;
use crate::errors::DeployError;
use crate::http::github::GithubRetrieval;
use crate::retrieval::Retrieval;
use crate::storage::file_store::FileStore;
use crate::storage::store::DeploymentStore;
use crate::tasks::queue::TaskQueue;
use crate::webhook::ingress::Ingress;

/// Main application state
pub struct AppState {
    /// Deployment records and the processing lock
    pub store: Arc<dyn DeploymentStore>,

    /// Deferred work
    pub queue: Arc<TaskQueue>,

    pub orchestrator: Arc<Orchestrator>,

    pub ingress: Arc<Ingress>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, DeployError> {
        info!("Initializing application state...");

        let layout = &options.storage.layout;
        layout.setup().await?;

        let store: Arc<dyn DeploymentStore> = Arc::new(FileStore::open(layout.store_file()).await?);
        let queue = Arc::new(TaskQueue::open(layout.tasks_file()).await?);
        if !queue.is_empty().await {
            info!("Restored {} queued tasks", queue.len().await);
        }

        let retrieval_options = &options.retrieval;
        let retrieval: Arc<dyn Retrieval> = Arc::new(GithubRetrieval::new(
            &retrieval_options.api_url,
            retrieval_options.token.clone(),
            &retrieval_options.owner,
            &retrieval_options.repo,
            retrieval_options.relay.clone(),
            retrieval_options.github.clone(),
        )?);

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            retrieval,
            queue.clone(),
            options.orchestrator.clone(),
        ));
        let ingress = Arc::new(Ingress::new(options.ingress.clone(), orchestrator.clone()));

        Ok(Self {
            store,
            queue,
            orchestrator,
            ingress,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), DeployError> {
        info!(
            "Shutting down application state ({} tasks queued)...",
            self.queue.len().await
        );
        Ok(())
    }
}
