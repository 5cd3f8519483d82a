//! Shared building blocks for the AlloyDB connectivity check.

pub mod config;
pub mod errors;
pub mod models;
