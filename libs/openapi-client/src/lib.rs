//! CI provider and relay API models

pub mod models;
