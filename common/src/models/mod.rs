//! Shared data models.

pub mod auth;
pub mod instance;

// Re-export commonly used types
pub use auth::{AuthType, IpType};
pub use instance::InstanceUri;
