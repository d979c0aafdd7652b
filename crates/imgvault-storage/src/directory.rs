//! Per-disk directory: image id → Index
//!
//! The directory is the authoritative answer to "does this id exist and
//! where are its bytes". It lives in a redb database next to the disk's
//! volume files, one database per disk path.

use crate::layout::Index;
use imgvault_common::{Error, Result};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// File name of the directory database inside a disk path
pub const DIRECTORY_FILE: &str = "directory.redb";

/// id → 64-byte Index header encoding
const INDEXES: TableDefinition<i64, &[u8]> = TableDefinition::new("indexes");

/// Outcome of [`Directory::save_unless_newer`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConditionalSave {
    /// The entry was written; holds the Index it replaced, if any
    Saved(Option<Index>),
    /// A newer entry was already present and was kept
    Kept(Index),
}

/// Persistent id → Index map for one disk
pub struct Directory {
    path: PathBuf,
    db: Database,
}

impl Directory {
    /// Open (or create) the directory stored under `disk_path`
    ///
    /// `disk_path` is created if it does not exist yet.
    pub fn open(disk_path: impl AsRef<Path>) -> Result<Self> {
        let disk_path = disk_path.as_ref();
        std::fs::create_dir_all(disk_path)?;
        let path = disk_path.join(DIRECTORY_FILE);
        let db = Database::create(&path).map_err(Error::directory)?;

        // Ensure the table exists so readers never see TableDoesNotExist
        let wtx = db.begin_write().map_err(Error::directory)?;
        wtx.open_table(INDEXES).map_err(Error::directory)?;
        wtx.commit().map_err(Error::directory)?;

        debug!("opened directory {}", path.display());
        Ok(Self { path, db })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: i64) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }

    pub fn get(&self, id: i64) -> Result<Option<Index>> {
        let rtx = self.db.begin_read().map_err(Error::directory)?;
        let table = rtx.open_table(INDEXES).map_err(Error::directory)?;
        match table.get(id).map_err(Error::directory)? {
            Some(value) => Ok(Some(Index::from_bytes(value.value())?)),
            None => Ok(None),
        }
    }

    /// Insert or overwrite by id (last write wins)
    pub fn save(&self, index: &Index) -> Result<()> {
        let bytes = index.to_bytes();
        let wtx = self.db.begin_write().map_err(Error::directory)?;
        {
            let mut table = wtx.open_table(INDEXES).map_err(Error::directory)?;
            table
                .insert(index.id, bytes.as_slice())
                .map_err(Error::directory)?;
        }
        wtx.commit().map_err(Error::directory)?;
        Ok(())
    }

    /// Remove an entry; returns the removed Index
    pub fn delete(&self, id: i64) -> Result<Option<Index>> {
        let wtx = self.db.begin_write().map_err(Error::directory)?;
        let removed = {
            let mut table = wtx.open_table(INDEXES).map_err(Error::directory)?;
            let old = table.remove(id).map_err(Error::directory)?;
            match old {
                Some(value) => Some(Index::from_bytes(value.value())?),
                None => None,
            }
        };
        wtx.commit().map_err(Error::directory)?;
        Ok(removed)
    }

    /// Remove an entry only if it still points at `(volume, offset)`
    ///
    /// Returns `false` if the entry is gone or was superseded by a newer save.
    pub fn delete_if_at(&self, id: i64, volume: i64, offset: u64) -> Result<bool> {
        let wtx = self.db.begin_write().map_err(Error::directory)?;
        let removed = {
            let mut table = wtx.open_table(INDEXES).map_err(Error::directory)?;
            let current = match table.get(id).map_err(Error::directory)? {
                Some(value) => Some(Index::from_bytes(value.value())?),
                None => None,
            };
            match current {
                Some(index) if index.volume == volume && index.offset == offset => {
                    table.remove(id).map_err(Error::directory)?;
                    true
                }
                _ => false,
            }
        };
        wtx.commit().map_err(Error::directory)?;
        Ok(removed)
    }

    /// Point `index.id` at `index` only if it still points at `(volume, offset)`
    pub fn replace_if_at(&self, index: &Index, volume: i64, offset: u64) -> Result<bool> {
        let bytes = index.to_bytes();
        let wtx = self.db.begin_write().map_err(Error::directory)?;
        let replaced = {
            let mut table = wtx.open_table(INDEXES).map_err(Error::directory)?;
            let current = match table.get(index.id).map_err(Error::directory)? {
                Some(value) => Some(Index::from_bytes(value.value())?),
                None => None,
            };
            match current {
                Some(current) if current.volume == volume && current.offset == offset => {
                    table
                        .insert(index.id, bytes.as_slice())
                        .map_err(Error::directory)?;
                    true
                }
                _ => false,
            }
        };
        wtx.commit().map_err(Error::directory)?;
        Ok(replaced)
    }

    /// Insert `index` unless the current entry was written at or after
    /// `written_at`
    pub fn save_unless_newer(&self, index: &Index, written_at: i64) -> Result<ConditionalSave> {
        let bytes = index.to_bytes();
        let wtx = self.db.begin_write().map_err(Error::directory)?;
        let outcome = {
            let mut table = wtx.open_table(INDEXES).map_err(Error::directory)?;
            let current = match table.get(index.id).map_err(Error::directory)? {
                Some(value) => Some(Index::from_bytes(value.value())?),
                None => None,
            };
            match current {
                Some(current) if current.time >= written_at => ConditionalSave::Kept(current),
                previous => {
                    table
                        .insert(index.id, bytes.as_slice())
                        .map_err(Error::directory)?;
                    ConditionalSave::Saved(previous)
                }
            }
        };
        wtx.commit().map_err(Error::directory)?;
        Ok(outcome)
    }

    /// Visit every id in ascending order until `f` breaks
    ///
    /// Each call reads from a fresh snapshot, so iteration can be restarted
    /// at any time. Mutating the directory from `f` is allowed; the running
    /// iteration does not observe it.
    pub fn for_each_id<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(i64) -> ControlFlow<()>,
    {
        self.for_each_index(|index| f(index.id))
    }

    /// Visit every Index in id order until `f` breaks
    pub fn for_each_index<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Index) -> ControlFlow<()>,
    {
        let rtx = self.db.begin_read().map_err(Error::directory)?;
        let table = rtx.open_table(INDEXES).map_err(Error::directory)?;
        for entry in table.iter().map_err(Error::directory)? {
            let (_, value) = entry.map_err(Error::directory)?;
            if f(Index::from_bytes(value.value())?).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Snapshot of all ids
    pub fn ids(&self) -> Result<Vec<i64>> {
        let mut ids = Vec::new();
        self.for_each_id(|id| {
            ids.push(id);
            ControlFlow::Continue(())
        })?;
        Ok(ids)
    }

    /// Number of entries
    pub fn len(&self) -> Result<u64> {
        let rtx = self.db.begin_read().map_err(Error::directory)?;
        let table = rtx.open_table(INDEXES).map_err(Error::directory)?;
        table.len().map_err(Error::directory)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Registry of open directories, one handle per disk path
///
/// Handles are opened lazily on first access and dropped by
/// [`Directories::close_all`].
#[derive(Default)]
pub struct Directories {
    open: Mutex<HashMap<PathBuf, Arc<Directory>>>,
}

impl Directories {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `disk_path`, opening it if needed
    pub fn get(&self, disk_path: impl AsRef<Path>) -> Result<Arc<Directory>> {
        let disk_path = disk_path.as_ref();
        let mut open = self.open.lock();
        if let Some(dir) = open.get(disk_path) {
            return Ok(Arc::clone(dir));
        }
        let dir = Arc::new(Directory::open(disk_path)?);
        open.insert(disk_path.to_path_buf(), Arc::clone(&dir));
        Ok(dir)
    }

    /// Number of open handles
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    /// Drop every handle; databases close once their last user lets go
    pub fn close_all(&self) {
        let mut open = self.open.lock();
        if !open.is_empty() {
            info!("closing {} directories", open.len());
        }
        open.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgvault_common::ImageType;
    use tempfile::tempdir;

    fn index(id: i64, volume: i64, offset: u64) -> Index {
        let mut index = Index::new(id, ImageType::Jpeg, 32);
        index.volume = volume;
        index.offset = offset;
        index
    }

    #[test]
    fn test_save_get_delete() {
        let dir = tempdir().unwrap();
        let directory = Directory::open(dir.path()).unwrap();

        assert!(!directory.contains(1).unwrap());
        directory.save(&index(1, 100, 0)).unwrap();
        assert!(directory.contains(1).unwrap());
        assert_eq!(directory.get(1).unwrap().unwrap().volume, 100);

        // Last write wins
        directory.save(&index(1, 200, 96)).unwrap();
        assert_eq!(directory.get(1).unwrap().unwrap().offset, 96);
        assert_eq!(directory.len().unwrap(), 1);

        assert_eq!(directory.delete(1).unwrap().unwrap().volume, 200);
        assert!(directory.delete(1).unwrap().is_none());
        assert!(directory.is_empty().unwrap());
    }

    #[test]
    fn test_conditional_delete() {
        let dir = tempdir().unwrap();
        let directory = Directory::open(dir.path()).unwrap();
        directory.save(&index(5, 100, 64)).unwrap();

        assert!(!directory.delete_if_at(5, 100, 0).unwrap());
        assert!(!directory.delete_if_at(5, 101, 64).unwrap());
        assert!(directory.delete_if_at(5, 100, 64).unwrap());
        assert!(!directory.contains(5).unwrap());

        directory.save(&index(6, 100, 64)).unwrap();
        assert!(!directory.replace_if_at(&index(6, 300, 0), 100, 0).unwrap());
        assert!(directory.replace_if_at(&index(6, 300, 0), 100, 64).unwrap());
        assert_eq!(directory.get(6).unwrap().unwrap().volume, 300);
        assert!(!directory.replace_if_at(&index(7, 300, 0), 100, 64).unwrap());
        assert!(!directory.contains(7).unwrap());
    }

    #[test]
    fn test_save_unless_newer() {
        let dir = tempdir().unwrap();
        let directory = Directory::open(dir.path()).unwrap();
        let mut newer = index(8, 100, 0);
        newer.time = 2_000;

        assert_eq!(
            directory.save_unless_newer(&newer, 2_000).unwrap(),
            ConditionalSave::Saved(None)
        );
        // Same or older write time keeps the stored entry
        let stale = index(8, 200, 64);
        assert_eq!(
            directory.save_unless_newer(&stale, 2_000).unwrap(),
            ConditionalSave::Kept(newer.clone())
        );
        assert_eq!(
            directory.save_unless_newer(&stale, 1_000).unwrap(),
            ConditionalSave::Kept(newer.clone())
        );
        assert_eq!(directory.get(8).unwrap().unwrap(), newer);

        assert_eq!(
            directory.save_unless_newer(&stale, 3_000).unwrap(),
            ConditionalSave::Saved(Some(newer))
        );
        assert_eq!(directory.get(8).unwrap().unwrap().volume, 200);
    }

    #[test]
    fn test_iteration_is_ordered_and_stoppable() {
        let dir = tempdir().unwrap();
        let directory = Directory::open(dir.path()).unwrap();
        for id in [30, -4, 7, 12] {
            directory.save(&index(id, 1, 0)).unwrap();
        }
        assert_eq!(directory.ids().unwrap(), vec![-4, 7, 12, 30]);

        let mut seen = Vec::new();
        directory
            .for_each_id(|id| {
                seen.push(id);
                if id >= 7 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(seen, vec![-4, 7]);
    }

    #[test]
    fn test_mutation_during_iteration() {
        let dir = tempdir().unwrap();
        let directory = Directory::open(dir.path()).unwrap();
        for id in 0..10 {
            directory.save(&index(id, 1, 0)).unwrap();
        }
        let mut visited = 0;
        directory
            .for_each_index(|index| {
                visited += 1;
                if index.id % 2 == 0 {
                    directory.delete(index.id).unwrap();
                }
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(visited, 10);
        assert_eq!(directory.ids().unwrap(), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_open_creates_missing_disk_path() {
        let dir = tempdir().unwrap();
        let disk_path = dir.path().join("n1d1").join("fresh");
        let directory = Directory::open(&disk_path).unwrap();
        directory.save(&index(1, 1, 0)).unwrap();
        assert!(disk_path.join(DIRECTORY_FILE).exists());

        let registry = Directories::new();
        registry.get(dir.path().join("n1d2")).unwrap();
        assert!(dir.path().join("n1d2").join(DIRECTORY_FILE).exists());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let directory = Directory::open(dir.path()).unwrap();
            directory.save(&index(42, 7, 128)).unwrap();
        }
        let directory = Directory::open(dir.path()).unwrap();
        assert_eq!(directory.get(42).unwrap().unwrap(), index(42, 7, 128));
    }

    #[test]
    fn test_registry_shares_handles() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let registry = Directories::new();

        let first = registry.get(a.path()).unwrap();
        let again = registry.get(a.path()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        registry.get(b.path()).unwrap();
        assert_eq!(registry.open_count(), 2);

        registry.close_all();
        assert_eq!(registry.open_count(), 0);
    }
}
