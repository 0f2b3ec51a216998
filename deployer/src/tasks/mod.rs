//! Deferred work

pub mod queue;
