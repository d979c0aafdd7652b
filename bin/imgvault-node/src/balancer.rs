//! Rebalancing after topology changes
//!
//! A run walks every id on every local disk, re-resolves it through the
//! current ring and moves whatever no longer belongs where it sits:
//!
//! ```text
//! owner = ring.route_id(id)
//!   owner.node != local  → transfer to owner node, then delete locally
//!   owner.disk != disk   → save on owner disk,      then delete here
//!   otherwise            → leave it
//! ```
//!
//! Clients write to the new owner as soon as the ring changes, so the target
//! may already hold a newer copy. A local move keeps whichever copy was
//! written last, and the source copy is only dropped while the directory
//! still points at the record that was moved.
//!
//! Any failure stops the whole run: the ring may already have moved on, and
//! the next topology event schedules a fresh run.
//!
//! Scheduling:
//! ```text
//!  Stopped ──start(delay)──► (wait delay) ──► Running ──► Stopped
//!                                                │
//!                                   cancel() ────┴──► Cancelled ──► Stopped
//! ```
//! Every `start` and `cancel` bumps a generation counter. A pending or
//! running run that sees a newer generation stops, which gives both
//! debouncing (a new trigger restarts the wait) and cancellation.

use crate::store::{Image, ImageStore};
use crate::transfer::{RemoteTransfer, TransferRequest};
use imgvault_common::{Error, Result};
use imgvault_placement::{Node, TopologyFeed};
use imgvault_storage::DiskStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Balancer lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalancerState {
    Stopped,
    Running,
    Cancelled,
}

/// Outcome of one balance run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BalanceReport {
    pub scanned: u64,
    pub moved_local: u64,
    pub transferred: u64,
}

/// Where an id has to go
enum Placement {
    Stay,
    LocalDisk(Arc<DiskStore>),
    Remote(Node),
}

pub struct Balancer {
    store: Arc<ImageStore>,
    feed: Arc<dyn TopologyFeed>,
    transfer: Arc<dyn RemoteTransfer>,
    generation: AtomicU64,
    /// Wakes pending and running runs when the generation changes
    wakeup: Notify,
    /// Held for the duration of a run
    run_lock: Mutex<()>,
    state: watch::Sender<BalancerState>,
}

impl Balancer {
    #[must_use]
    pub fn new(
        store: Arc<ImageStore>,
        feed: Arc<dyn TopologyFeed>,
        transfer: Arc<dyn RemoteTransfer>,
    ) -> Self {
        let (state, _) = watch::channel(BalancerState::Stopped);
        Self {
            store,
            feed,
            transfer,
            generation: AtomicU64::new(0),
            wakeup: Notify::new(),
            run_lock: Mutex::new(()),
            state,
        }
    }

    #[must_use]
    pub fn state(&self) -> BalancerState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<BalancerState> {
        self.state.subscribe()
    }

    /// Schedule a run after `delay`
    ///
    /// A later `start` or `cancel` supersedes this one; the handle then
    /// resolves to `Ok(None)` (never started) or `Err(Error::Cancelled)`.
    pub fn start(self: &Arc<Self>, delay: Duration) -> JoinHandle<Result<Option<BalanceReport>>> {
        let generation = self.bump();
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_after(generation, delay).await })
    }

    /// Stop any pending or running run and wait until it has stopped
    pub async fn cancel(&self) {
        self.bump();
        self.state.send_if_modified(|state| {
            let running = *state == BalancerState::Running;
            if running {
                *state = BalancerState::Cancelled;
            }
            running
        });
        // The running run holds this until it has observed the cancellation
        drop(self.run_lock.lock().await);
    }

    fn bump(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.wakeup.notify_waiters();
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Resolves once `generation` is superseded
    async fn superseded(&self, generation: u64) {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_current(generation) {
                return;
            }
            notified.await;
        }
    }

    async fn run_after(&self, generation: u64, delay: Duration) -> Result<Option<BalanceReport>> {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = self.superseded(generation) => {
                debug!("balance run {generation} superseded before start");
                return Ok(None);
            }
        }

        let _running = self.run_lock.lock().await;
        if !self.is_current(generation) {
            return Ok(None);
        }

        self.state.send_replace(BalancerState::Running);
        let local = self.store.local_node();
        self.feed.set_balanced(local, false);
        info!("balance run {generation} started");

        let result = self.run(generation).await;
        match &result {
            Ok(report) => {
                info!(
                    "balance run {generation} finished: scanned {}, moved {} locally, transferred {}",
                    report.scanned, report.moved_local, report.transferred
                );
                self.feed.set_balanced(local, true);
            }
            Err(Error::Cancelled) => info!("balance run {generation} cancelled"),
            Err(e) => {
                error!("balance run {generation} stopped: {e}");
                self.state.send_replace(BalancerState::Cancelled);
            }
        }
        self.state.send_replace(BalancerState::Stopped);
        result.map(Some)
    }

    async fn run(&self, generation: u64) -> Result<BalanceReport> {
        let mut report = BalanceReport::default();
        for disk in self.store.disks() {
            let ids = {
                let disk = Arc::clone(&disk);
                self.store.run_blocking(move || disk.directory().ids()).await?
            };
            debug!("balancing {} ids on disk {}", ids.len(), disk.key());

            for id in ids {
                if !self.is_current(generation) {
                    return Err(Error::Cancelled);
                }
                report.scanned += 1;
                match self.placement(&disk, id)? {
                    Placement::Stay => {}
                    Placement::LocalDisk(target) => {
                        if self.move_local(&disk, &target, id).await? {
                            report.moved_local += 1;
                        }
                    }
                    Placement::Remote(node) => {
                        if self.transfer_remote(&disk, &node, id, generation).await? {
                            report.transferred += 1;
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    fn placement(&self, disk: &DiskStore, id: i64) -> Result<Placement> {
        let owner = self.store.ring().route_id(id)?;
        if owner.node != self.store.local_node() {
            let node = self
                .store
                .ring()
                .node(owner.node)
                .ok_or(Error::NodeNotFound(owner.node))?;
            return Ok(Placement::Remote(node));
        }
        if owner.disk != disk.key().disk {
            let target = self.store.disk(owner.disk).ok_or(Error::DiskNotFound(owner))?;
            return Ok(Placement::LocalDisk(target));
        }
        Ok(Placement::Stay)
    }

    /// Returns `false` if nothing was copied: the id vanished (deleted or
    /// expired) or the target already holds a newer write
    async fn move_local(
        &self,
        from: &Arc<DiskStore>,
        to: &Arc<DiskStore>,
        id: i64,
    ) -> Result<bool> {
        let (from, to) = (Arc::clone(from), Arc::clone(to));
        self.store
            .run_blocking(move || {
                let Some(record) = from.get(id)? else {
                    return Ok(false);
                };
                let written_at = record.index.time;
                let template = Image::from(record.clone()).to_index();
                let copied = to
                    .save_unless_newer(&template, &record.payload, written_at)?
                    .is_some();
                if !from.delete_if_at(&record.index)? {
                    debug!("image {id} rewritten on disk {} during move", from.key());
                }
                if copied {
                    debug!("moved image {id} from disk {} to {}", from.key(), to.key());
                } else {
                    debug!("disk {} holds a newer image {id}, dropped stale copy", to.key());
                }
                Ok(copied)
            })
            .await
    }

    async fn transfer_remote(
        &self,
        disk: &Arc<DiskStore>,
        node: &Node,
        id: i64,
        generation: u64,
    ) -> Result<bool> {
        let record = {
            let disk = Arc::clone(disk);
            self.store.run_blocking(move || disk.get(id)).await?
        };
        let Some(record) = record else {
            return Ok(false);
        };
        let sent_index = record.index.clone();
        let request = TransferRequest::from(Image::from(record));

        tokio::select! {
            sent = self.transfer.send(node, &request) => {
                if let Err(e) = sent {
                    warn!("transfer of image {id} to node {} failed: {e}", node.id);
                    return Err(e);
                }
            }
            () = self.superseded(generation) => return Err(Error::Cancelled),
        }

        let disk = Arc::clone(disk);
        let removed = self
            .store
            .run_blocking(move || disk.delete_if_at(&sent_index))
            .await?;
        if removed {
            debug!("transferred image {id} to node {}", node.id);
        } else {
            debug!("transferred image {id} to node {}, local copy was rewritten", node.id);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{config, node_of};
    use async_trait::async_trait;
    use imgvault_common::{DiskId, DiskKey, ImageType, NodeId};
    use imgvault_placement::{HashRing, LocalTopologyFeed, TopologyEvent};
    use imgvault_storage::Index;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    type SendHook = Box<dyn Fn(&TransferRequest) + Send + Sync>;

    /// Records every send; fails the `fail_at`-th call (1-based) if set
    #[derive(Default)]
    struct MockTransfer {
        sent: SyncMutex<Vec<(NodeId, TransferRequest)>>,
        calls: AtomicUsize,
        fail_at: Option<usize>,
        delay: Option<Duration>,
        on_send: Option<SendHook>,
    }

    #[async_trait]
    impl RemoteTransfer for MockTransfer {
        async fn send(&self, node: &Node, request: &TransferRequest) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(hook) = &self.on_send {
                hook(request);
            }
            if self.fail_at == Some(call) {
                return Err(Error::Transfer {
                    address: node.endpoint(),
                    reason: "simulated".into(),
                });
            }
            self.sent.lock().push((node.id, request.clone()));
            Ok(())
        }
    }

    struct Cluster {
        _dir: TempDir,
        ring: Arc<HashRing>,
        feed: Arc<LocalTopologyFeed>,
        store: Arc<ImageStore>,
        remote: Node,
    }

    /// Local node 1 with two disks holding 200 images; remote node 2 known
    /// to the feed but not yet on the ring
    async fn cluster() -> Cluster {
        let dir = tempfile::tempdir().unwrap();
        let local_config = config(dir.path(), 1, 2);
        let local = node_of(&local_config);
        let remote = node_of(&config(dir.path(), 2, 1));

        let ring = Arc::new(HashRing::build([local.clone()], 50));
        let feed = Arc::new(LocalTopologyFeed::new(NodeId(1), [local]));
        let store = Arc::new(ImageStore::open(&local_config, Arc::clone(&ring)).unwrap());
        for id in 0..200 {
            store
                .save(Image::new(id, ImageType::Png, id.to_be_bytes().to_vec()))
                .await
                .unwrap();
        }
        Cluster {
            _dir: dir,
            ring,
            feed,
            store,
            remote,
        }
    }

    fn balancer(c: &Cluster, transfer: Arc<MockTransfer>) -> Arc<Balancer> {
        Arc::new(Balancer::new(
            Arc::clone(&c.store),
            Arc::clone(&c.feed) as Arc<dyn TopologyFeed>,
            transfer,
        ))
    }

    /// Every (disk, id) pair held locally
    fn local_ids(store: &ImageStore) -> Vec<(DiskKey, i64)> {
        store
            .disks()
            .iter()
            .flat_map(|d| {
                let key = d.key();
                d.directory().ids().unwrap().into_iter().map(move |id| (key, id))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_disk_removal_converges_locally() {
        let c = cluster().await;
        let gone = DiskKey::new(NodeId(1), DiskId(2));
        let on_gone = local_ids(&c.store).iter().filter(|(k, _)| *k == gone).count();
        assert!(on_gone > 0);

        c.ring.remove_disk(gone).unwrap();
        let balancer = balancer(&c, Arc::new(MockTransfer::default()));
        let report = balancer.start(Duration::ZERO).await.unwrap().unwrap().unwrap();

        assert_eq!(report.scanned, 200);
        assert_eq!(report.moved_local, on_gone as u64);
        assert_eq!(report.transferred, 0);
        for (key, id) in local_ids(&c.store) {
            assert_ne!(key, gone);
            assert_eq!(c.ring.route_id(id).unwrap(), key);
        }
        for id in 0..200i64 {
            let image = c.store.get(id).await.unwrap().unwrap();
            assert_eq!(image.payload.as_ref(), &id.to_be_bytes());
        }
        assert_eq!(balancer.state(), BalancerState::Stopped);
        assert!(c.feed.snapshot()[0].balanced);
    }

    #[tokio::test]
    async fn test_local_move_keeps_newer_write_on_target() {
        let c = cluster().await;
        let gone = DiskKey::new(NodeId(1), DiskId(2));
        let on_gone: Vec<i64> = local_ids(&c.store)
            .into_iter()
            .filter(|(k, _)| *k == gone)
            .map(|(_, id)| id)
            .collect();
        let id = on_gone[0];

        // The ring moves first; a client rewrites the id on its new owner
        // before the balancer gets to it
        c.ring.remove_disk(gone).unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let index = c
            .store
            .save(Image::new(id, ImageType::Png, &b"rewritten"[..]))
            .await
            .unwrap();
        assert_ne!(c.ring.route_id(id).unwrap(), gone);

        let balancer = balancer(&c, Arc::new(MockTransfer::default()));
        let report = balancer.start(Duration::ZERO).await.unwrap().unwrap().unwrap();
        assert_eq!(report.moved_local, on_gone.len() as u64 - 1);

        let image = c.store.get(id).await.unwrap().unwrap();
        assert_eq!(image.payload.as_ref(), b"rewritten");
        let owner = c.store.owner(id).unwrap();
        assert_eq!(owner.directory().get(id).unwrap().unwrap(), index);
        assert!(!c.store.disk(DiskId(2)).unwrap().contains(id).unwrap());
    }

    #[tokio::test]
    async fn test_transfer_keeps_local_copy_rewritten_during_send() {
        let c = cluster().await;
        c.ring.add_node(c.remote.clone());
        let (key, id) = local_ids(&c.store)
            .into_iter()
            .find(|(_, id)| c.ring.route_id(*id).unwrap().node == NodeId(2))
            .unwrap();
        let disk = c.store.disk(key.disk).unwrap();

        let rewrite = Arc::clone(&disk);
        let transfer = Arc::new(MockTransfer {
            on_send: Some(Box::new(move |request: &TransferRequest| {
                if request.id == id {
                    rewrite
                        .save(&Index::new(id, ImageType::Gif, 0), b"late write")
                        .unwrap();
                }
            })),
            ..Default::default()
        });
        let balancer = balancer(&c, Arc::clone(&transfer));
        balancer.start(Duration::ZERO).await.unwrap().unwrap().unwrap();

        assert!(transfer.sent.lock().iter().any(|(_, r)| r.id == id));
        let kept = disk.get(id).unwrap().unwrap();
        assert_eq!(kept.payload.as_ref(), b"late write");
    }

    #[tokio::test]
    async fn test_node_addition_transfers_and_deletes() {
        let c = cluster().await;
        c.ring.add_node(c.remote.clone());
        let transfer = Arc::new(MockTransfer::default());
        let balancer = balancer(&c, Arc::clone(&transfer));

        let report = balancer.start(Duration::ZERO).await.unwrap().unwrap().unwrap();
        let sent = transfer.sent.lock().clone();
        assert!(!sent.is_empty());
        assert_eq!(report.transferred, sent.len() as u64);

        for (node, request) in &sent {
            assert_eq!(*node, NodeId(2));
            assert_eq!(c.ring.route_id(request.id).unwrap().node, NodeId(2));
            assert_eq!(request.payload.as_ref(), &request.id.to_be_bytes());
        }
        let remaining = local_ids(&c.store);
        assert_eq!(remaining.len() + sent.len(), 200);
        for (key, id) in remaining {
            assert_eq!(c.ring.route_id(id).unwrap(), key);
        }
    }

    #[tokio::test]
    async fn test_transfer_failure_stops_whole_run() {
        let c = cluster().await;
        c.ring.add_node(c.remote.clone());
        let transfer = Arc::new(MockTransfer {
            fail_at: Some(3),
            ..Default::default()
        });
        let balancer = balancer(&c, Arc::clone(&transfer));

        let res = balancer.start(Duration::ZERO).await.unwrap();
        assert!(matches!(res, Err(Error::Transfer { .. })));
        assert_eq!(transfer.calls.load(Ordering::SeqCst), 3);

        // Two moved, everything else untouched and readable
        let sent: Vec<i64> = transfer.sent.lock().iter().map(|(_, r)| r.id).collect();
        assert_eq!(sent.len(), 2);
        assert_eq!(local_ids(&c.store).len(), 198);
        for id in 0..200i64 {
            let held = c.store.disks().iter().any(|d| d.contains(id).unwrap());
            assert_eq!(held, !sent.contains(&id), "id {id}");
        }
        assert!(!c.feed.snapshot()[0].balanced);
        assert_eq!(balancer.state(), BalancerState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_during_delay_debounces() {
        let c = cluster().await;
        let balancer = balancer(&c, Arc::new(MockTransfer::default()));

        let first = balancer.start(Duration::from_millis(200));
        let second = balancer.start(Duration::from_millis(20));
        assert_eq!(first.await.unwrap().unwrap(), None);
        assert!(second.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_waits_for_running_run() {
        let c = cluster().await;
        c.ring.add_node(c.remote.clone());
        let transfer = Arc::new(MockTransfer {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let balancer = balancer(&c, Arc::clone(&transfer));
        let mut state = balancer.subscribe_state();

        let handle = balancer.start(Duration::ZERO);
        state
            .wait_for(|s| *s == BalancerState::Running)
            .await
            .unwrap();
        // Let the run reach its first transfer
        while transfer.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        balancer.cancel().await;
        assert_eq!(balancer.state(), BalancerState::Stopped);
        assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(local_ids(&c.store).len(), 200);
    }

    #[tokio::test]
    async fn test_balanced_flag_event_is_published() {
        let c = cluster().await;
        let mut events = c.feed.subscribe();
        let balancer = balancer(&c, Arc::new(MockTransfer::default()));
        balancer.start(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            TopologyEvent::BalancedChanged(NodeId(1), false)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            TopologyEvent::BalancedChanged(NodeId(1), true)
        );
    }
}
