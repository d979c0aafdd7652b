//! Per-disk storage engine
//!
//! A [`DiskStore`] owns everything that lives under one disk path: the
//! volume files, the active writer handle, the directory, and the lock that
//! serializes compaction on this disk.
//!
//! Save path:
//! ```text
//! save(index, payload)
//!   └─ active writer (rotate if the record would pass volume_max_size)
//!        └─ Volume::append  → stamped Index
//!   └─ Directory::save(stamped)
//!   └─ soft-delete the superseded record, if any
//! ```

use crate::directory::{ConditionalSave, Directory};
use crate::layout::Index;
use crate::volume::{Record, Volume, VolumeWriter, list_volumes, remove_volume_file};
use imgvault_common::{DiskKey, Error, Result, now_millis};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Running counters for one disk
#[derive(Debug, Default)]
pub struct DiskCounters {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub deletes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub rotations: AtomicU64,
}

/// Point-in-time view of a disk
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskStats {
    pub volumes: usize,
    pub bytes: u64,
    pub entries: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub rotations: u64,
}

/// Storage engine for one disk
pub struct DiskStore {
    key: DiskKey,
    path: PathBuf,
    volume_max_size: u64,
    directory: Arc<Directory>,
    volumes: RwLock<BTreeMap<i64, Arc<Volume>>>,
    /// Active writer; held across rotate-and-append so only one save rotates
    writer: Mutex<Option<VolumeWriter>>,
    compaction: Mutex<()>,
    counters: DiskCounters,
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("key", &self.key)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DiskStore {
    /// Open the disk at `path`, reopening any volumes already there
    ///
    /// The newest existing volume becomes the active writer again if it is
    /// still below `volume_max_size`; otherwise a fresh volume is created on
    /// the first save.
    pub fn open(
        key: DiskKey,
        path: impl AsRef<Path>,
        directory: Arc<Directory>,
        volume_max_size: u64,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let mut volumes = BTreeMap::new();
        for (id, file) in list_volumes(&path)? {
            let volume = Volume::open(&file)?;
            volumes.insert(id, Arc::new(volume));
        }

        let writer = volumes
            .values()
            .next_back()
            .filter(|v| v.len() < volume_max_size)
            .map(|v| VolumeWriter::new(Arc::clone(v)));
        for volume in volumes.values() {
            if writer.as_ref().is_none_or(|w| w.volume_id() != volume.id()) {
                volume.seal();
            }
        }

        info!(
            "disk {key} opened at {} with {} volumes",
            path.display(),
            volumes.len()
        );
        Ok(Self {
            key,
            path,
            volume_max_size,
            directory,
            volumes: RwLock::new(volumes),
            writer: Mutex::new(writer),
            compaction: Mutex::new(()),
            counters: DiskCounters::default(),
        })
    }

    #[must_use]
    pub const fn key(&self) -> DiskKey {
        self.key
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn volume_max_size(&self) -> u64 {
        self.volume_max_size
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Append a record and index it
    ///
    /// Returns the stamped Index. A previous record under the same id is
    /// soft-deleted.
    pub fn save(&self, index: &Index, payload: &[u8]) -> Result<Index> {
        let previous = self.directory.get(index.id)?;
        let stamped = self.append(index, payload)?;
        self.directory.save(&stamped)?;

        if let Some(old) = previous
            && (old.volume, old.offset) != (stamped.volume, stamped.offset)
            && let Err(e) = self.soft_delete(&old)
        {
            warn!("disk {}: could not soft-delete superseded record {}: {e}", self.key, old.id);
        }
        Ok(stamped)
    }

    /// Save a copy of a record first written at `written_at`, unless this disk
    /// already holds a write of the same id from that time or later
    ///
    /// Returns `None` when the local entry was kept.
    pub fn save_unless_newer(
        &self,
        index: &Index,
        payload: &[u8],
        written_at: i64,
    ) -> Result<Option<Index>> {
        if self
            .directory
            .get(index.id)?
            .is_some_and(|current| current.time >= written_at)
        {
            return Ok(None);
        }
        let stamped = self.append(index, payload)?;
        match self.directory.save_unless_newer(&stamped, written_at)? {
            ConditionalSave::Saved(previous) => {
                if let Some(old) = previous
                    && let Err(e) = self.soft_delete(&old)
                {
                    warn!(
                        "disk {}: could not soft-delete superseded record {}: {e}",
                        self.key, old.id
                    );
                }
                Ok(Some(stamped))
            }
            ConditionalSave::Kept(_) => {
                debug!("disk {}: kept newer write of id {}", self.key, index.id);
                self.soft_delete(&stamped)?;
                Ok(None)
            }
        }
    }

    /// Copy a record to the active writer and repoint the directory, unless
    /// the directory no longer points at the record's current location
    ///
    /// Returns `None` when the record was superseded; the fresh copy is then
    /// soft-deleted.
    pub fn relocate(&self, record: &Record) -> Result<Option<Index>> {
        let old = &record.index;
        let moved = self.append(old, &record.payload)?;
        if self.directory.replace_if_at(&moved, old.volume, old.offset)? {
            Ok(Some(moved))
        } else {
            debug!("disk {}: id {} superseded during relocation", self.key, old.id);
            self.soft_delete(&moved)?;
            Ok(None)
        }
    }

    /// Live record for `id`; expired records read as absent
    ///
    /// If the record is moved by compaction between the directory lookup and
    /// the volume read, the lookup is repeated.
    pub fn get(&self, id: i64) -> Result<Option<Record>> {
        loop {
            let Some(index) = self.directory.get(id)? else {
                return Ok(None);
            };
            if index.is_expired(now_millis()) {
                return Ok(None);
            }
            let record = match self.read_record(&index) {
                Ok(record) => record,
                Err(e @ (Error::VolumeNotFound(_) | Error::CorruptRecord { .. })) => {
                    let at = (index.volume, index.offset);
                    let moved = self
                        .directory
                        .get(id)?
                        .is_none_or(|now| (now.volume, now.offset) != at);
                    if moved {
                        debug!("disk {}: id {id} moved during read, retrying", self.key);
                        continue;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            self.counters.reads.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_read
                .fetch_add(record.payload.len() as u64, Ordering::Relaxed);
            return Ok(Some(record));
        }
    }

    fn read_record(&self, index: &Index) -> Result<Record> {
        let volume = self
            .volume(index.volume)
            .ok_or(Error::VolumeNotFound(index.volume))?;
        let record = volume.read(index.offset)?;
        if record.index.id != index.id {
            return Err(Error::CorruptRecord {
                volume: index.volume,
                offset: index.offset,
                reason: format!("expected id {}, found {}", index.id, record.index.id),
            });
        }
        Ok(record)
    }

    /// Whether the directory holds `id`
    pub fn contains(&self, id: i64) -> Result<bool> {
        self.directory.contains(id)
    }

    /// Soft-delete the record and drop its directory entry
    ///
    /// Returns `false` if `id` was not stored here.
    pub fn delete(&self, id: i64) -> Result<bool> {
        loop {
            let Some(index) = self.directory.get(id)? else {
                return Ok(false);
            };
            self.soft_delete(&index)?;
            // A concurrent relocation may have moved it; chase the new copy
            if self.directory.delete_if_at(id, index.volume, index.offset)? {
                self.counters.deletes.fetch_add(1, Ordering::Relaxed);
                return Ok(true);
            }
        }
    }

    /// Drop the directory entry for `index.id` only if it still points at
    /// `index`, then soft-delete that record
    ///
    /// Returns `false` if the id was deleted or rewritten meanwhile.
    pub fn delete_if_at(&self, index: &Index) -> Result<bool> {
        if !self
            .directory
            .delete_if_at(index.id, index.volume, index.offset)?
        {
            return Ok(false);
        }
        self.soft_delete(index)?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Drop a volume and remove its file
    pub fn retire_volume(&self, id: i64) -> Result<()> {
        {
            let mut writer = self.writer.lock();
            if writer.as_ref().is_some_and(|w| w.volume_id() == id) {
                *writer = None;
            }
        }
        let volume = self
            .volumes
            .write()
            .remove(&id)
            .ok_or(Error::VolumeNotFound(id))?;
        volume.seal();
        remove_volume_file(&volume)
    }

    /// Stop appends to `id`; if it is the active volume the next save rotates
    pub fn seal_volume(&self, id: i64) -> Result<()> {
        let volume = self.volume(id).ok_or(Error::VolumeNotFound(id))?;
        let mut writer = self.writer.lock();
        if writer.as_ref().is_some_and(|w| w.volume_id() == id) {
            *writer = None;
        }
        volume.seal();
        Ok(())
    }

    #[must_use]
    pub fn volume(&self, id: i64) -> Option<Arc<Volume>> {
        self.volumes.read().get(&id).cloned()
    }

    /// Snapshot of all volumes, oldest first
    #[must_use]
    pub fn volumes(&self) -> Vec<Arc<Volume>> {
        self.volumes.read().values().cloned().collect()
    }

    /// Id of the volume currently receiving appends
    #[must_use]
    pub fn active_volume_id(&self) -> Option<i64> {
        self.writer.lock().as_ref().map(VolumeWriter::volume_id)
    }

    /// Serializes compaction passes on this disk
    pub fn lock_compaction(&self) -> MutexGuard<'_, ()> {
        self.compaction.lock()
    }

    /// Force the active volume to stable storage
    pub fn flush(&self) -> Result<()> {
        let writer = self.writer.lock().clone();
        match writer {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> Result<DiskStats> {
        let volumes = self.volumes.read();
        Ok(DiskStats {
            volumes: volumes.len(),
            bytes: volumes.values().map(|v| v.len()).sum(),
            entries: self.directory.len()?,
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            rotations: self.counters.rotations.load(Ordering::Relaxed),
        })
    }

    fn append(&self, index: &Index, payload: &[u8]) -> Result<Index> {
        let record_len = crate::layout::INDEX_SIZE as u64 + payload.len() as u64;
        let mut active = self.writer.lock();

        let needs_rotation = match active.as_ref() {
            None => true,
            Some(w) => w.volume().is_sealed() || w.would_exceed(record_len, self.volume_max_size),
        };
        if needs_rotation {
            let writer = self.rotate(active.take())?;
            *active = Some(writer);
        }

        let writer = active
            .as_ref()
            .ok_or_else(|| Error::internal("no active writer after rotation"))?;
        let stamped = writer.write(index, payload)?;

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(stamped.record_len(), Ordering::Relaxed);
        Ok(stamped)
    }

    fn rotate(&self, old: Option<VolumeWriter>) -> Result<VolumeWriter> {
        if let Some(old) = old {
            old.flush()?;
            old.volume().seal();
            debug!(
                "disk {}: rotating away from volume {} at {} bytes",
                self.key,
                old.volume_id(),
                old.volume().len()
            );
        }
        let volume = Arc::new(Volume::create(&self.path)?);
        self.volumes.write().insert(volume.id(), Arc::clone(&volume));
        self.counters.rotations.fetch_add(1, Ordering::Relaxed);
        info!("disk {}: new active volume {}", self.key, volume.id());
        Ok(VolumeWriter::new(volume))
    }

    fn soft_delete(&self, index: &Index) -> Result<()> {
        match self.volume(index.volume) {
            Some(volume) => volume.mark_deleted(index.offset),
            None => {
                warn!(
                    "disk {}: volume {} missing while deleting id {}",
                    self.key, index.volume, index.id
                );
                Ok(())
            }
        }
    }
}
