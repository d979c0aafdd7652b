//! ImgVault Storage Engine - append-only volumes
//!
//! This crate implements the per-disk storage engine:
//! - Fixed 64-byte record headers ([`layout`])
//! - Append-only volume files with soft delete ([`volume`])
//! - The id → Index directory, backed by redb ([`directory`])
//! - Per-disk engine with active writer rotation ([`disk`])
//! - Mark-then-copy compaction ([`compaction`])

pub mod compaction;
pub mod directory;
pub mod disk;
pub mod layout;
pub mod volume;

// Re-exports
pub use compaction::{CompactionReport, Compactor};
pub use directory::{ConditionalSave, DIRECTORY_FILE, Directories, Directory};
pub use disk::{DiskCounters, DiskStats, DiskStore};
pub use layout::{FLAG_OFFSET, INDEX_SIZE, Index};
pub use volume::{Record, Volume, VolumeReader, VolumeWriter};
