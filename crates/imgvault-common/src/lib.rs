//! ImgVault Common - Shared types and utilities
//!
//! This crate provides identifiers, error definitions, configuration and
//! retry helpers used across all ImgVault components.

pub mod codec;
pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use config::{Config, DiskConfig, LoggingConfig, NodeConfig, StoreConfig};
pub use error::{Error, Result};
pub use retry::{Attempts, RetryPolicy, retry_async, retry_blocking};
pub use types::*;
