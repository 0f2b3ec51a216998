//! Deployer Library
//!
//! Core modules for the webhook-driven theme deployer.

pub mod app;
pub mod deploy;
pub mod diagnostics;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod retrieval;
pub mod server;
pub mod storage;
pub mod tasks;
pub mod utils;
pub mod webhook;
pub mod workers;
