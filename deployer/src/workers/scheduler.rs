//! Scheduler worker: runs queued deployment tasks when they come due

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::deploy::orchestrator::Orchestrator;

/// Scheduler worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Longest sleep between queue checks when nothing is due
    pub idle_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(30),
        }
    }
}

/// Run every task that is due now. Returns how many ran.
pub async fn run_due(orchestrator: &Orchestrator) -> usize {
    let due = orchestrator.queue().take_due(Utc::now()).await;
    let count = due.len();
    for task in due {
        // failures are logged and requeued by the orchestrator
        let _ = orchestrator.run_task(&task).await;
    }
    count
}

/// Run the scheduler worker
pub async fn run<S, F>(
    options: &Options,
    orchestrator: Arc<Orchestrator>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Scheduler worker starting...");

    loop {
        let ran = run_due(&orchestrator).await;
        if ran > 0 {
            debug!("Ran {} scheduled tasks", ran);
        }

        let wait = match orchestrator.queue().next_run_at().await {
            Some(at) => (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(options.idle_interval),
            None => options.idle_interval,
        };

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Scheduler worker shutting down...");
                return;
            }
            _ = sleep_fn(wait) => {}
            _ = orchestrator.queue().notified() => {}
        }
    }
}
