//! Deployer HTTP API models

pub mod models;
