//! Error types for ImgVault
//!
//! This module defines the common error type used throughout the system.

use crate::types::{DiskKey, NodeId};
use thiserror::Error;

/// Common result type for ImgVault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ImgVault
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("volume not found: {0}")]
    VolumeNotFound(i64),

    #[error("volume {0} is sealed")]
    VolumeSealed(i64),

    #[error("corrupt record in volume {volume} at offset {offset}: {reason}")]
    CorruptRecord {
        volume: i64,
        offset: u64,
        reason: String,
    },

    #[error("directory error: {0}")]
    Directory(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("image too large: {size} bytes exceeds max {max_size} bytes")]
    ImageTooLarge { size: usize, max_size: usize },

    // Placement errors
    #[error("hash ring is empty")]
    EmptyRing,

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("disk not found: {0}")]
    DiskNotFound(DiskKey),

    #[error("image {id} belongs to node {node}")]
    NotLocal { id: i64, node: NodeId },

    // Background task errors
    #[error("transfer to {address} failed: {reason}")]
    Transfer { address: String, reason: String },

    #[error("balance run cancelled")]
    Cancelled,

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a directory error
    pub fn directory(msg: impl ToString) -> Self {
        Self::Directory(msg.to_string())
    }

    /// Check if this is a retryable error
    ///
    /// Transient I/O and transfer failures are retried; routing errors and
    /// format errors are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DiskIo(_) | Self::Directory(_) | Self::VolumeSealed(_) | Self::Transfer { .. }
        )
    }
}
