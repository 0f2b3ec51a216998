//! Integration tests for the deployer

mod common;
mod test_extract;
mod test_orchestrator;
mod test_webhook;
