//! Server state

use std::sync::Arc;

use crate::deploy::orchestrator::Orchestrator;
use crate::webhook::ingress::Ingress;

/// Server state shared across handlers
pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
    pub ingress: Arc<Ingress>,

    /// Run continuations right after the response instead of queueing them
    pub inline_continuation: bool,
}

impl ServerState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        ingress: Arc<Ingress>,
        inline_continuation: bool,
    ) -> Self {
        Self {
            orchestrator,
            ingress,
            inline_continuation,
        }
    }
}
