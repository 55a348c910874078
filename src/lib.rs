// Core modules
pub mod api;
pub mod chain;
pub mod commands;
pub mod config;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod persistence;

// Re-export commonly used types
pub use commands::BoundaryAdapter;
pub use config::BotConfig;
pub use error::{ChainError, VendorError};
pub use models::*;

// Error handling
pub type Result<T> = anyhow::Result<T>;
