//! Volume compaction
//!
//! Mark-then-copy: each pass scans every volume of a disk, adds up the bytes
//! held by dead records (deleted, expired or superseded), and rewrites the
//! live records of any volume whose dead bytes pass the limit into the
//! active writer. The old volume is removed once every live record has a
//! new home.
//!
//! ```text
//! scan    ──► dead_bytes > limit? ──no──► leave for next period
//!                    │yes
//!                    ▼
//!           seal volume (no more appends)
//!                    ▼
//!           relocate each live record (retried)
//!                    ▼
//!           retire volume (file removed)
//! ```
//!
//! Expired records are discovered here: the directory entry of an expired
//! record is removed during the scan.

use crate::disk::DiskStore;
use crate::layout::Index;
use crate::volume::Volume;
use imgvault_common::{Result, RetryPolicy, StoreConfig, now_millis, retry_blocking};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Outcome of compacting one disk
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub volumes_scanned: usize,
    pub volumes_compacted: usize,
    pub records_moved: u64,
    pub records_expired: u64,
    pub bytes_reclaimed: u64,
    pub failures: usize,
}

impl CompactionReport {
    fn merge(&mut self, other: &Self) {
        self.volumes_scanned += other.volumes_scanned;
        self.volumes_compacted += other.volumes_compacted;
        self.records_moved += other.records_moved;
        self.records_expired += other.records_expired;
        self.bytes_reclaimed += other.bytes_reclaimed;
        self.failures += other.failures;
    }
}

/// Background compactor
pub struct Compactor {
    /// Dead bytes above which a volume is rewritten
    dead_bytes_limit: u64,
    /// Policy for individual record relocations
    retry: RetryPolicy,
    /// Set while a pass over all disks runs
    running: AtomicBool,
}

impl Compactor {
    #[must_use]
    pub const fn new(dead_bytes_limit: u64, retry: RetryPolicy) -> Self {
        Self {
            dead_bytes_limit,
            retry,
            running: AtomicBool::new(false),
        }
    }

    /// Limit derived from `volume_max_size * (1 - volume_compact_threshold)`
    #[must_use]
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.compact_dead_bytes(), RetryPolicy::default())
    }

    #[must_use]
    pub const fn dead_bytes_limit(&self) -> u64 {
        self.dead_bytes_limit
    }

    /// One pass over one disk
    ///
    /// A failing volume is logged and counted; its siblings are still
    /// processed.
    pub fn compact_disk(&self, disk: &DiskStore) -> CompactionReport {
        let _guard = disk.lock_compaction();
        let mut report = CompactionReport::default();

        for volume in disk.volumes() {
            report.volumes_scanned += 1;
            if let Err(e) = self.compact_volume(disk, &volume, &mut report) {
                error!(
                    "disk {}: compaction of volume {} failed: {e}",
                    disk.key(),
                    volume.id()
                );
                report.failures += 1;
            }
        }

        if report.volumes_compacted > 0 || report.records_expired > 0 {
            info!(
                "disk {}: compacted {}/{} volumes, moved {} records, expired {}, reclaimed {} bytes",
                disk.key(),
                report.volumes_compacted,
                report.volumes_scanned,
                report.records_moved,
                report.records_expired,
                report.bytes_reclaimed
            );
        }
        report
    }

    /// One pass over every disk, disks in parallel on the blocking pool
    ///
    /// Returns `None` if another pass is still running.
    pub async fn compact_all(
        self: &Arc<Self>,
        disks: &[Arc<DiskStore>],
    ) -> Option<CompactionReport> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("compaction pass already running, skipping");
            return None;
        }

        let tasks = disks.iter().map(|disk| {
            let compactor = Arc::clone(self);
            let disk = Arc::clone(disk);
            tokio::task::spawn_blocking(move || compactor.compact_disk(&disk))
        });
        let mut total = CompactionReport::default();
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok(report) => total.merge(&report),
                Err(e) => {
                    error!("compaction task panicked: {e}");
                    total.failures += 1;
                }
            }
        }

        self.running.store(false, Ordering::Release);
        Some(total)
    }

    /// Run passes every `period` until `shutdown` flips to `true`
    pub async fn run(
        self: Arc<Self>,
        disks: Vec<Arc<DiskStore>>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(
            "compactor started: {} disks, period {period:?}, dead-bytes limit {}",
            disks.len(),
            self.dead_bytes_limit
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(report) = self.compact_all(&disks).await
                        && report.failures > 0
                    {
                        warn!("compaction pass finished with {} failures", report.failures);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("compactor stopped");
    }

    fn compact_volume(
        &self,
        disk: &DiskStore,
        volume: &Arc<Volume>,
        report: &mut CompactionReport,
    ) -> Result<()> {
        let now = now_millis();
        let directory = disk.directory();

        // Scan/mark
        let mut dead_bytes = 0u64;
        for record in volume.reader() {
            let index = record?.index;
            if index.is_deleted() {
                dead_bytes += index.record_len();
                continue;
            }
            if !points_here(disk, &index)? {
                dead_bytes += index.record_len();
                continue;
            }
            if index.is_expired(now) {
                if directory.delete_if_at(index.id, index.volume, index.offset)? {
                    report.records_expired += 1;
                }
                dead_bytes += index.record_len();
            }
        }

        if dead_bytes <= self.dead_bytes_limit {
            return Ok(());
        }

        // Compact
        debug!(
            "disk {}: volume {} has {dead_bytes} dead bytes, compacting",
            disk.key(),
            volume.id()
        );
        disk.seal_volume(volume.id())?;
        let mut moved_bytes = 0u64;
        for record in volume.reader() {
            let record = record?;
            let index = &record.index;
            if index.is_dead(now) || !points_here(disk, index)? {
                continue;
            }
            if retry_blocking(&self.retry, || disk.relocate(&record))?.is_some() {
                report.records_moved += 1;
                moved_bytes += index.record_len();
            }
        }

        let len = volume.len();
        disk.retire_volume(volume.id())?;
        report.volumes_compacted += 1;
        report.bytes_reclaimed += len.saturating_sub(moved_bytes);
        Ok(())
    }
}

/// Whether the directory still points at this exact record
fn points_here(disk: &DiskStore, index: &Index) -> Result<bool> {
    Ok(disk
        .directory()
        .get(index.id)?
        .is_some_and(|current| current.volume == index.volume && current.offset == index.offset))
}
