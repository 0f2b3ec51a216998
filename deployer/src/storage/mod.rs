//! Storage management

pub mod file_store;
pub mod layout;
pub mod memory;
pub mod settings;
pub mod store;
