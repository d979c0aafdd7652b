//! Core type definitions for ImgVault
//!
//! This module defines identifiers and small value types shared by the
//! placement, storage and node crates.

use crate::codec;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Expire time meaning "never expires"
pub const NEVER_EXPIRES: i64 = -1;

/// Identifier of a cluster node (unique within the cluster)
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct NodeId(pub u16);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Identifier of a disk (unique within its node)
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct DiskId(pub u16);

impl fmt::Debug for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiskId({})", self.0)
    }
}

/// Cluster-wide disk address: `(node, disk)`.
///
/// Disks never point back at their node; a `DiskKey` is resolved through
/// the router's node table instead.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{node}/{disk}")]
pub struct DiskKey {
    pub node: NodeId,
    pub disk: DiskId,
}

impl DiskKey {
    #[must_use]
    pub const fn new(node: NodeId, disk: DiskId) -> Self {
        Self { node, disk }
    }

    /// Stable 32-bit identifier used to seed virtual node generation
    #[must_use]
    pub const fn unique_id(&self) -> u32 {
        codec::combine16(self.node.0, self.disk.0)
    }

    /// Inverse of [`DiskKey::unique_id`]
    #[must_use]
    pub const fn from_unique_id(id: u32) -> Self {
        let (node, disk) = codec::split16(id);
        Self {
            node: NodeId(node),
            disk: DiskId(disk),
        }
    }
}

impl fmt::Debug for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiskKey({}/{})", self.node.0, self.disk.0)
    }
}

/// Image content type, stored as a single byte code in the record header
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageType {
    #[default]
    Unknown,
    Jpeg,
    Png,
    Gif,
    Webp,
    Bmp,
    /// Code not known to this build; preserved as-is
    Other(u8),
}

impl ImageType {
    /// Byte code used on disk
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Jpeg => 1,
            Self::Png => 2,
            Self::Gif => 3,
            Self::Webp => 4,
            Self::Bmp => 5,
            Self::Other(c) => c,
        }
    }

    /// Decode a byte code
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Unknown,
            1 => Self::Jpeg,
            2 => Self::Png,
            3 => Self::Gif,
            4 => Self::Webp,
            5 => Self::Bmp,
            c => Self::Other(c),
        }
    }

    /// MIME type, when known
    #[must_use]
    pub const fn mime(self) -> Option<&'static str> {
        match self {
            Self::Jpeg => Some("image/jpeg"),
            Self::Png => Some("image/png"),
            Self::Gif => Some("image/gif"),
            Self::Webp => Some("image/webp"),
            Self::Bmp => Some("image/bmp"),
            Self::Unknown | Self::Other(_) => None,
        }
    }
}

/// Record state flag (one byte in the record header)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IndexFlag {
    #[default]
    Normal = 0,
    Deleted = 1,
}

impl IndexFlag {
    /// Decode a flag byte; anything non-zero counts as deleted
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        if v == 0 { Self::Normal } else { Self::Deleted }
    }
}

/// Current wall clock time in milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// True if `expire_time` lies in the past relative to `now`
#[must_use]
pub const fn is_expired(expire_time: i64, now: i64) -> bool {
    expire_time != NEVER_EXPIRES && expire_time >= 0 && expire_time < now
}
