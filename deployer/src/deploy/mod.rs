//! Deployment module

pub mod backup;
pub mod extract;
pub mod fsm;
pub mod lock;
pub mod orchestrator;
