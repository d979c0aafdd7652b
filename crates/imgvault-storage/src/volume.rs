//! Append-only volume files
//!
//! A volume is one file named after its creation timestamp (ms). Records are
//! appended as `[Index (64B)][payload]` and never move; the only in-place
//! change is flipping a record's flag byte (soft delete).
//!
//! Access roles:
//! - [`VolumeReader`]: cursor for sequential iteration plus random `read`
//! - [`VolumeWriter`]: the append handle a disk hands out for saves
//! - [`Volume::mark_deleted`] / [`Volume::mark_normal`]: the updater
//!
//! All three go through one per-volume `RwLock` over the volume's length.
//! Readers share it; appends and flag flips take it exclusively, so a reader
//! never observes a half-written flag or a partially appended record. I/O is
//! positional (`pread`/`pwrite`), so no role moves a shared file cursor.

use crate::layout::{FLAG_OFFSET, INDEX_SIZE, Index};
use bytes::Bytes;
use imgvault_common::{Error, IndexFlag, Result, now_millis};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// One stored record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub index: Index,
    pub payload: Bytes,
}

/// An append-only volume file
pub struct Volume {
    id: i64,
    path: PathBuf,
    file: File,
    /// Bytes of complete records; guards every access to the file
    len: RwLock<u64>,
    /// Set once the volume stops accepting appends
    sealed: AtomicBool,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("len", &*self.len.read())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl Volume {
    /// Create a fresh volume in `dir`, named after the current time
    ///
    /// If a file with that name exists the id is bumped until a free one is
    /// found.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut id = now_millis();
        loop {
            let path = dir.join(id.to_string());
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    debug!("created volume {id} at {}", path.display());
                    return Ok(Self {
                        id,
                        path,
                        file,
                        len: RwLock::new(0),
                        sealed: AtomicBool::new(false),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => id += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Open an existing volume file
    ///
    /// A torn record at the tail (crash mid-append) is truncated away so that
    /// later appends stay reachable by sequential iteration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let id = volume_id_from_path(&path)
            .ok_or_else(|| Error::storage(format!("not a volume file: {}", path.display())))?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();

        let valid = scan_valid_len(&file, file_len)?;
        if valid < file_len {
            warn!(
                "volume {id}: truncating torn tail ({} of {file_len} bytes)",
                file_len - valid
            );
            file.set_len(valid)?;
        }

        Ok(Self {
            id,
            path,
            file,
            len: RwLock::new(valid),
            sealed: AtomicBool::new(false),
        })
    }

    /// Volume id (creation timestamp in ms)
    #[must_use]
    pub const fn id(&self) -> i64 {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length in bytes
    #[must_use]
    pub fn len(&self) -> u64 {
        *self.len.read()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting appends
    pub fn seal(&self) {
        if !self.sealed.swap(true, Ordering::AcqRel) {
            debug!("volume {} sealed at {} bytes", self.id, self.len());
        }
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Append a record
    ///
    /// Stamps `offset` (current length), `volume` (this file) and `time`
    /// (now), writes header and payload, and returns the stamped index.
    pub fn append(&self, index: &Index, payload: &[u8]) -> Result<Index> {
        let size = u32::try_from(payload.len()).map_err(|_| Error::ImageTooLarge {
            size: payload.len(),
            max_size: u32::MAX as usize,
        })?;

        let mut len = self.len.write();
        if self.is_sealed() {
            return Err(Error::VolumeSealed(self.id));
        }

        let mut stamped = index.clone();
        stamped.volume = self.id;
        stamped.offset = *len;
        stamped.size = size;
        stamped.time = now_millis();

        let mut buf = Vec::with_capacity(INDEX_SIZE + payload.len());
        buf.extend_from_slice(&stamped.to_bytes());
        buf.extend_from_slice(payload);
        self.file.write_all_at(&buf, *len)?;
        *len += stamped.record_len();

        Ok(stamped)
    }

    /// Force appended data to stable storage
    pub fn flush(&self) -> Result<()> {
        let _guard = self.len.read();
        self.file.sync_data()?;
        Ok(())
    }

    /// Read the record whose header starts at `offset`
    pub fn read(&self, offset: u64) -> Result<Record> {
        let len = self.len.read();
        self.read_locked(offset, *len)?
            .ok_or_else(|| self.corrupt(offset, "record extends past end of volume"))
    }

    /// Read only the header at `offset`
    pub fn read_index(&self, offset: u64) -> Result<Index> {
        let len = self.len.read();
        if offset + INDEX_SIZE as u64 > *len {
            return Err(self.corrupt(offset, "header extends past end of volume"));
        }
        let mut header = [0u8; INDEX_SIZE];
        self.file.read_exact_at(&mut header, offset)?;
        Index::from_bytes(&header)
    }

    /// Soft-delete the record at `offset`
    pub fn mark_deleted(&self, offset: u64) -> Result<()> {
        self.set_flag(offset, IndexFlag::Deleted)
    }

    /// Undo a soft delete
    pub fn mark_normal(&self, offset: u64) -> Result<()> {
        self.set_flag(offset, IndexFlag::Normal)
    }

    fn set_flag(&self, offset: u64, flag: IndexFlag) -> Result<()> {
        let len = self.len.write();
        if offset + INDEX_SIZE as u64 > *len {
            return Err(self.corrupt(offset, "no record header at offset"));
        }
        self.file.write_all_at(&[flag as u8], offset + FLAG_OFFSET)?;
        Ok(())
    }

    /// Sequential reader starting at offset 0
    #[must_use]
    pub fn reader(&self) -> VolumeReader<'_> {
        VolumeReader {
            volume: self,
            pos: 0,
        }
    }

    /// `None` when the record at `offset` is incomplete (short read)
    fn read_locked(&self, offset: u64, len: u64) -> Result<Option<Record>> {
        if offset + INDEX_SIZE as u64 > len {
            return Ok(None);
        }
        let mut header = [0u8; INDEX_SIZE];
        if !read_exact_or_eof(&self.file, &mut header, offset)? {
            return Ok(None);
        }
        let index = Index::from_bytes(&header)?;
        if offset + index.record_len() > len {
            return Ok(None);
        }

        let mut payload = vec![0u8; index.size as usize];
        if !read_exact_or_eof(&self.file, &mut payload, offset + INDEX_SIZE as u64)? {
            return Ok(None);
        }
        Ok(Some(Record {
            index,
            payload: Bytes::from(payload),
        }))
    }

    fn corrupt(&self, offset: u64, reason: &str) -> Error {
        Error::CorruptRecord {
            volume: self.id,
            offset,
            reason: reason.to_string(),
        }
    }
}

/// Cursor over a volume's records
///
/// Iteration ends at the first incomplete record rather than failing.
pub struct VolumeReader<'a> {
    volume: &'a Volume,
    pos: u64,
}

impl VolumeReader<'_> {
    /// Move the cursor to `pos`
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Current cursor position
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.pos
    }

    /// Random read; does not move the cursor
    pub fn read(&self, pos: u64) -> Result<Record> {
        self.volume.read(pos)
    }
}

impl Iterator for VolumeReader<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.volume.len.read();
        match self.volume.read_locked(self.pos, *len) {
            Ok(Some(record)) => {
                self.pos += record.index.record_len();
                Some(Ok(record))
            }
            Ok(None) => None,
            Err(e) => {
                // Do not spin on the same bad offset
                self.pos = *len;
                Some(Err(e))
            }
        }
    }
}

/// Append handle for a disk's active volume
#[derive(Clone, Debug)]
pub struct VolumeWriter {
    volume: Arc<Volume>,
}

impl VolumeWriter {
    #[must_use]
    pub const fn new(volume: Arc<Volume>) -> Self {
        Self { volume }
    }

    /// Append a record; see [`Volume::append`]
    pub fn write(&self, index: &Index, payload: &[u8]) -> Result<Index> {
        self.volume.append(index, payload)
    }

    pub fn flush(&self) -> Result<()> {
        self.volume.flush()
    }

    /// Whether appending `record_len` more bytes would pass `max_size`
    #[must_use]
    pub fn would_exceed(&self, record_len: u64, max_size: u64) -> bool {
        let len = self.volume.len();
        len > 0 && len + record_len > max_size
    }

    #[must_use]
    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    #[must_use]
    pub fn volume_id(&self) -> i64 {
        self.volume.id()
    }
}

/// Parse a volume id from a file name
#[must_use]
pub fn volume_id_from_path(path: &Path) -> Option<i64> {
    path.file_name()?.to_str()?.parse::<i64>().ok()
}

/// List volume files in `dir`, oldest first
pub fn list_volumes(dir: impl AsRef<Path>) -> Result<Vec<(i64, PathBuf)>> {
    let mut volumes = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if let Some(id) = volume_id_from_path(&path) {
            volumes.push((id, path));
        }
    }
    volumes.sort_by_key(|(id, _)| *id);
    Ok(volumes)
}

/// Remove a retired volume file
pub fn remove_volume_file(volume: &Volume) -> Result<()> {
    match std::fs::remove_file(volume.path()) {
        Ok(()) => {
            info!("removed volume {}", volume.id());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// `Ok(false)` on a short read at end-of-file
fn read_exact_or_eof(file: &File, buf: &mut [u8], offset: u64) -> Result<bool> {
    match file.read_exact_at(buf, offset) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Length covered by complete records
fn scan_valid_len(file: &File, file_len: u64) -> Result<u64> {
    let mut pos = 0u64;
    let mut header = [0u8; INDEX_SIZE];
    while pos + INDEX_SIZE as u64 <= file_len {
        if !read_exact_or_eof(file, &mut header, pos)? {
            break;
        }
        let index = Index::from_bytes(&header)?;
        if pos + index.record_len() > file_len {
            break;
        }
        pos += index.record_len();
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgvault_common::{ImageType, NEVER_EXPIRES};
    use std::io::Write;
    use tempfile::tempdir;

    fn write_records(volume: &Volume, n: usize) -> Vec<Index> {
        (0..n)
            .map(|i| {
                let payload = vec![i as u8; 10 + i * 7];
                let expire_time = if i % 2 == 0 {
                    NEVER_EXPIRES
                } else {
                    9_999 + i as i64
                };
                let index = Index::new(i as i64, ImageType::Png, 0).with_expire_time(expire_time);
                volume.append(&index, &payload).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_sequential_round_trip() {
        let dir = tempdir().unwrap();
        let volume = Volume::create(dir.path()).unwrap();
        let written = write_records(&volume, 5);

        let mut expected_offset = 0u64;
        let records: Vec<Record> = volume.reader().map(Result::unwrap).collect();
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.index.offset, expected_offset);
            assert_eq!(record.index.id, i as i64);
            assert_eq!(record.index.image_type, ImageType::Png);
            assert_eq!(record.index.volume, volume.id());
            assert_eq!(record.index.expire_time, written[i].expire_time);
            assert_eq!(record.payload.as_ref(), vec![i as u8; 10 + i * 7].as_slice());
            expected_offset += 64 + (10 + i * 7) as u64;
        }
        assert_eq!(volume.len(), expected_offset);
    }

    #[test]
    fn test_random_read_and_seek() {
        let dir = tempdir().unwrap();
        let volume = Volume::create(dir.path()).unwrap();
        let written = write_records(&volume, 3);

        let record = volume.read(written[2].offset).unwrap();
        assert_eq!(record.index, written[2]);

        let mut reader = volume.reader();
        reader.seek(written[1].offset);
        assert_eq!(reader.next().unwrap().unwrap().index.id, 1);
        assert_eq!(reader.position(), written[2].offset);

        assert!(matches!(
            volume.read(volume.len()),
            Err(Error::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_soft_delete_toggles_only_the_flag() {
        let dir = tempdir().unwrap();
        let volume = Volume::create(dir.path()).unwrap();
        let written = write_records(&volume, 2);
        let offset = written[1].offset;
        let before = volume.read(offset).unwrap();

        volume.mark_deleted(offset).unwrap();
        volume.mark_normal(offset).unwrap();
        volume.mark_deleted(offset).unwrap();

        let after = volume.read(offset).unwrap();
        assert!(after.index.is_deleted());
        assert_eq!(after.payload, before.payload);
        assert_eq!(after.index.offset, before.index.offset);
        assert_eq!(after.index.size, before.index.size);
        assert_eq!(volume.read(written[0].offset).unwrap().index.flag, IndexFlag::Normal);
        assert_eq!(volume.len(), written[1].end());
    }

    #[test]
    fn test_sealed_volume_rejects_appends() {
        let dir = tempdir().unwrap();
        let volume = Volume::create(dir.path()).unwrap();
        volume.seal();
        let res = volume.append(&Index::new(1, ImageType::Jpeg, 0), b"abc");
        assert!(matches!(res, Err(Error::VolumeSealed(id)) if id == volume.id()));
    }

    #[test]
    fn test_reopen_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        let (id, path) = {
            let volume = Volume::create(dir.path()).unwrap();
            write_records(&volume, 3);
            volume.flush().unwrap();
            (volume.id(), volume.path().to_path_buf())
        };

        // Half a header at the end
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[7u8; 20]).unwrap();
        drop(file);

        let volume = Volume::open(&path).unwrap();
        assert_eq!(volume.id(), id);
        assert_eq!(volume.reader().count(), 3);
        let next = volume.append(&Index::new(99, ImageType::Gif, 0), b"tail").unwrap();
        let ids: Vec<i64> = volume.reader().map(|r| r.unwrap().index.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 99]);
        assert_eq!(volume.read(next.offset).unwrap().payload.as_ref(), b"tail");
    }

    #[test]
    fn test_create_bumps_colliding_ids() {
        let dir = tempdir().unwrap();
        let a = Volume::create(dir.path()).unwrap();
        let b = Volume::create(dir.path()).unwrap();
        assert_ne!(a.id(), b.id());
        let listed: Vec<i64> = list_volumes(dir.path())
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_writer_rotation_threshold() {
        let dir = tempdir().unwrap();
        let writer = VolumeWriter::new(Arc::new(Volume::create(dir.path()).unwrap()));
        // An empty volume always accepts the first record
        assert!(!writer.would_exceed(1_000, 100));
        writer.write(&Index::new(1, ImageType::Png, 0), &[0u8; 16]).unwrap();
        assert!(!writer.would_exceed(20, 100));
        assert!(writer.would_exceed(21, 100));
    }
}
