//! Filesystem utilities

pub mod dir;
pub mod file;
