//! Record layout definitions
//!
//! A volume is a sequence of records, each a fixed header followed by the
//! raw payload:
//! ```text
//! +----------+----------+------+----------+--------+------+----------+------------+-------------+-----------+
//! | id       | volume   | flag | offset   | size   | type | time     | expireTime | replication | padding   |
//! | i64 (8)  | i64 (8)  | (1)  | u64 (8)  | u32(4) | (1)  | i64 (8)  | i64 (8)    | (1)         | 17 bytes  |
//! +----------+----------+------+----------+--------+------+----------+------------+-------------+-----------+
//! |<------------------------------------------ 64 bytes ------------------------------------------------>|
//! followed by `size` payload bytes
//! ```
//!
//! All multi-byte fields are big-endian. The layout is versionless: changing
//! a field's order or width is an on-disk migration.

use bytes::{Buf, BufMut, BytesMut};
use imgvault_common::{Error, ImageType, IndexFlag, NEVER_EXPIRES, Result};

/// Record header size
pub const INDEX_SIZE: usize = 64;

/// Position of the flag byte within a record header
pub const FLAG_OFFSET: u64 = 16;

/// Bytes used by the header fields; the rest is zero padding
const FIELDS_SIZE: usize = 47;

/// Location and state of one stored image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Index {
    /// Image id
    pub id: i64,
    /// Volume holding the record
    pub volume: i64,
    pub flag: IndexFlag,
    /// Offset of the record header within the volume
    pub offset: u64,
    /// Payload size in bytes
    pub size: u32,
    pub image_type: ImageType,
    /// Write timestamp (ms since epoch)
    pub time: i64,
    /// Expiry timestamp (ms since epoch), or [`NEVER_EXPIRES`]
    pub expire_time: i64,
    pub replication: u8,
}

impl Index {
    /// Index for a record not yet written; the writer stamps the location
    #[must_use]
    pub fn new(id: i64, image_type: ImageType, size: u32) -> Self {
        Self {
            id,
            volume: 0,
            flag: IndexFlag::Normal,
            offset: 0,
            size,
            image_type,
            time: 0,
            expire_time: NEVER_EXPIRES,
            replication: 1,
        }
    }

    /// Builder-style expiry
    #[must_use]
    pub const fn with_expire_time(mut self, expire_time: i64) -> Self {
        self.expire_time = expire_time;
        self
    }

    /// Builder-style replication count
    #[must_use]
    pub const fn with_replication(mut self, replication: u8) -> Self {
        self.replication = replication;
        self
    }

    /// Total bytes the record occupies in its volume
    #[must_use]
    pub const fn record_len(&self) -> u64 {
        INDEX_SIZE as u64 + self.size as u64
    }

    /// Offset one past the end of the record
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.record_len()
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        matches!(self.flag, IndexFlag::Deleted)
    }

    #[must_use]
    pub const fn is_expired(&self, now: i64) -> bool {
        imgvault_common::is_expired(self.expire_time, now)
    }

    /// Deleted or past its expiry
    #[must_use]
    pub const fn is_dead(&self, now: i64) -> bool {
        self.is_deleted() || self.is_expired(now)
    }

    /// Serialize to the fixed 64-byte header
    #[must_use]
    pub fn to_bytes(&self) -> [u8; INDEX_SIZE] {
        let mut buf = BytesMut::with_capacity(INDEX_SIZE);
        buf.put_i64(self.id);
        buf.put_i64(self.volume);
        buf.put_u8(self.flag as u8);
        buf.put_u64(self.offset);
        buf.put_u32(self.size);
        buf.put_u8(self.image_type.code());
        buf.put_i64(self.time);
        buf.put_i64(self.expire_time);
        buf.put_u8(self.replication);
        debug_assert_eq!(buf.len(), FIELDS_SIZE);
        buf.resize(INDEX_SIZE, 0);

        let mut out = [0u8; INDEX_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse a header
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < INDEX_SIZE {
            return Err(Error::storage(format!(
                "index header too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = &data[..INDEX_SIZE];

        let id = buf.get_i64();
        let volume = buf.get_i64();
        let flag = IndexFlag::from_u8(buf.get_u8());
        let offset = buf.get_u64();
        let size = buf.get_u32();
        let image_type = ImageType::from_code(buf.get_u8());
        let time = buf.get_i64();
        let expire_time = buf.get_i64();
        let replication = buf.get_u8();

        Ok(Self {
            id,
            volume,
            flag,
            offset,
            size,
            image_type,
            time,
            expire_time,
            replication,
        })
    }
}
