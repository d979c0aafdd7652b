//! Node-level image store
//!
//! Routes an image id through the ring to one of this node's disks and runs
//! the blocking disk work on a bounded pool, so callers get a future back
//! instead of tying up their own thread.

use bytes::Bytes;
use imgvault_common::{
    Config, DiskId, DiskKey, Error, ImageType, NEVER_EXPIRES, NodeId, Result, RetryPolicy,
    retry_blocking,
};
use imgvault_placement::HashRing;
use imgvault_storage::{Directories, DiskStats, DiskStore, Index, Record};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// An image as seen by callers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    pub id: i64,
    pub image_type: ImageType,
    pub payload: Bytes,
    /// Expiry (ms since epoch), or `NEVER_EXPIRES`
    pub expire_time: i64,
    pub replication: u8,
}

impl Image {
    #[must_use]
    pub fn new(id: i64, image_type: ImageType, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            image_type,
            payload: payload.into(),
            expire_time: NEVER_EXPIRES,
            replication: 1,
        }
    }

    #[must_use]
    pub const fn with_expire_time(mut self, expire_time: i64) -> Self {
        self.expire_time = expire_time;
        self
    }

    #[must_use]
    pub const fn with_replication(mut self, replication: u8) -> Self {
        self.replication = replication;
        self
    }

    /// Index template for a save; the volume writer stamps the location
    #[must_use]
    pub fn to_index(&self) -> Index {
        Index::new(self.id, self.image_type, 0)
            .with_expire_time(self.expire_time)
            .with_replication(self.replication)
    }
}

impl From<Record> for Image {
    fn from(record: Record) -> Self {
        Self {
            id: record.index.id,
            image_type: record.index.image_type,
            payload: record.payload,
            expire_time: record.index.expire_time,
            replication: record.index.replication,
        }
    }
}

/// Tuning for an [`ImageStore`]
#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub image_max_size: usize,
    pub replication_factor: usize,
    /// Retry policy used by [`ImageStore::save`]
    pub save_retry: RetryPolicy,
    /// Concurrent blocking disk operations
    pub workers: usize,
}

impl StoreOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            image_max_size: config.store.image_max_size,
            replication_factor: usize::from(config.store.replication_factor),
            save_retry: RetryPolicy::default(),
            workers: std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get),
        }
    }
}

/// All disks of the local node behind one routing facade
pub struct ImageStore {
    local: NodeId,
    ring: Arc<HashRing>,
    disks: BTreeMap<DiskId, Arc<DiskStore>>,
    directories: Directories,
    pool: Semaphore,
    options: StoreOptions,
}

impl ImageStore {
    /// Open every disk named in the node configuration
    pub fn open(config: &Config, ring: Arc<HashRing>) -> Result<Self> {
        let local = NodeId(config.node.id);
        let directories = Directories::new();
        let mut disks = Vec::with_capacity(config.node.disks.len());
        for disk in &config.node.disks {
            let key = DiskKey::new(local, DiskId(disk.id));
            let directory = directories.get(&disk.path)?;
            let store = DiskStore::open(key, &disk.path, directory, config.store.volume_max_size)?;
            disks.push(Arc::new(store));
        }
        Ok(Self::new(
            local,
            ring,
            disks,
            directories,
            StoreOptions::from_config(config),
        ))
    }

    #[must_use]
    pub fn new(
        local: NodeId,
        ring: Arc<HashRing>,
        disks: Vec<Arc<DiskStore>>,
        directories: Directories,
        options: StoreOptions,
    ) -> Self {
        info!(
            "image store for node {local}: {} disks, {} workers",
            disks.len(),
            options.workers
        );
        Self {
            local,
            ring,
            disks: disks.into_iter().map(|d| (d.key().disk, d)).collect(),
            directories,
            pool: Semaphore::new(options.workers.max(1)),
            options,
        }
    }

    #[must_use]
    pub const fn local_node(&self) -> NodeId {
        self.local
    }

    #[must_use]
    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    #[must_use]
    pub const fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Local disks in id order
    #[must_use]
    pub fn disks(&self) -> Vec<Arc<DiskStore>> {
        self.disks.values().cloned().collect()
    }

    #[must_use]
    pub fn disk(&self, id: DiskId) -> Option<Arc<DiskStore>> {
        self.disks.get(&id).cloned()
    }

    /// Local disk that owns `id`, or [`Error::NotLocal`]
    pub fn owner(&self, id: i64) -> Result<Arc<DiskStore>> {
        let key = self.ring.route_id(id)?;
        if key.node != self.local {
            return Err(Error::NotLocal { id, node: key.node });
        }
        self.disk(key.disk).ok_or(Error::DiskNotFound(key))
    }

    /// Disks that should hold copies of `id`, primary first
    pub fn replicas(&self, id: i64) -> Result<Vec<DiskKey>> {
        self.ring
            .route_replicas_id(id, self.options.replication_factor)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Image>> {
        let disk = self.owner(id)?;
        let record = self.run_blocking(move || disk.get(id)).await?;
        Ok(record.map(Image::from))
    }

    /// Save with the configured retry policy
    pub async fn save(&self, image: Image) -> Result<Index> {
        let policy = self.options.save_retry.clone();
        self.save_with(image, &policy).await
    }

    /// Save with an explicit retry policy
    pub async fn save_with(&self, image: Image, policy: &RetryPolicy) -> Result<Index> {
        if image.payload.len() > self.options.image_max_size {
            return Err(Error::ImageTooLarge {
                size: image.payload.len(),
                max_size: self.options.image_max_size,
            });
        }
        let disk = self.owner(image.id)?;
        let policy = policy.clone();
        let index = self
            .run_blocking(move || {
                let template = image.to_index();
                retry_blocking(&policy, || disk.save(&template, &image.payload))
            })
            .await?;
        debug!("saved image {} to volume {} @ {}", index.id, index.volume, index.offset);
        Ok(index)
    }

    /// Returns `false` if the id was not stored
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let disk = self.owner(id)?;
        self.run_blocking(move || disk.delete(id)).await
    }

    pub async fn stats(&self) -> Result<Vec<(DiskKey, DiskStats)>> {
        let disks = self.disks();
        self.run_blocking(move || {
            disks
                .iter()
                .map(|d| d.stats().map(|s| (d.key(), s)))
                .collect()
        })
        .await
    }

    /// Flush active volumes and close the directories
    pub fn close(&self) {
        for disk in self.disks.values() {
            if let Err(e) = disk.flush() {
                warn!("disk {}: flush on close failed: {e}", disk.key());
            }
        }
        self.directories.close_all();
    }

    /// Run blocking disk work on the bounded pool
    pub(crate) async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| Error::internal("worker pool closed"))?;
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| Error::internal(format!("worker task failed: {e}")))?
    }
}
