//! Background workers

pub mod poller;
pub mod scheduler;
