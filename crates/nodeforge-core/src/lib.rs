//! nodeforge-core: configuration and retry policy shared by every
//! nodeforge crate.

pub mod config;
pub mod retry;

pub use config::ForgeConfig;
pub use retry::RetryPolicy;
