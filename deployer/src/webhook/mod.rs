//! Webhook ingress

pub mod events;
pub mod ingress;
pub mod signature;
