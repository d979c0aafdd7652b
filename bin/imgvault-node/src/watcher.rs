//! Topology watcher: keeps the ring in step with the feed and schedules
//! balance runs when membership or weights change.

use crate::balancer::Balancer;
use imgvault_placement::{HashRing, TopologyFeed};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Follow `feed` until `shutdown` flips to `true` or the feed closes
pub async fn watch_topology(
    feed: Arc<dyn TopologyFeed>,
    ring: Arc<HashRing>,
    balancer: Arc<Balancer>,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // Subscribe before the snapshot so no event falls in between
    let mut events = feed.subscribe();
    ring.rebuild(feed.snapshot());
    info!(
        "topology watcher started: {} nodes, {} ring positions",
        ring.node_count(),
        ring.len()
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    debug!("topology event: {event:?}");
                    if let Err(e) = ring.apply(&event) {
                        warn!("could not apply {event:?}, rebuilding ring: {e}");
                        ring.rebuild(feed.snapshot());
                    }
                    if event.triggers_balance() {
                        reschedule(&balancer, delay).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("topology watcher missed {missed} events, rebuilding ring");
                    ring.rebuild(feed.snapshot());
                    reschedule(&balancer, delay).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("topology feed closed");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("topology watcher stopped");
}

async fn reschedule(balancer: &Arc<Balancer>, delay: Duration) {
    balancer.cancel().await;
    // The handle is not needed: the run reports through logs and its state
    drop(balancer.start(delay));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::BalancerState;
    use crate::store::tests::{config, node_of};
    use crate::store::{Image, ImageStore};
    use crate::transfer::{RemoteTransfer, TransferRequest};
    use async_trait::async_trait;
    use imgvault_common::{DiskId, DiskKey, ImageType, NodeId, Result};
    use imgvault_placement::{LocalTopologyFeed, Node, TopologyEvent};

    struct NoTransfer;

    #[async_trait]
    impl RemoteTransfer for NoTransfer {
        async fn send(&self, _node: &Node, _request: &TransferRequest) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_patch_ring_and_trigger_balance() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), 1, 2);
        let feed = Arc::new(LocalTopologyFeed::new(NodeId(1), [node_of(&cfg)]));
        let ring = Arc::new(HashRing::new(50));
        let store = Arc::new(ImageStore::open(&cfg, Arc::clone(&ring)).unwrap());
        let balancer = Arc::new(Balancer::new(
            Arc::clone(&store),
            Arc::clone(&feed) as Arc<dyn TopologyFeed>,
            Arc::new(NoTransfer),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);

        let watcher = tokio::spawn(watch_topology(
            Arc::clone(&feed) as Arc<dyn TopologyFeed>,
            Arc::clone(&ring),
            Arc::clone(&balancer),
            Duration::from_millis(10),
            stop_rx,
        ));

        // Wait for the seed rebuild
        while ring.is_empty() {
            tokio::task::yield_now().await;
        }
        for id in 0..50 {
            store
                .save(Image::new(id, ImageType::Jpeg, vec![7u8; 4]))
                .await
                .unwrap();
        }

        let gone = DiskKey::new(NodeId(1), DiskId(2));
        let disk = store.disk(DiskId(2)).unwrap();
        assert!(!disk.directory().ids().unwrap().is_empty());
        assert!(feed.publish(TopologyEvent::DiskRemoved(gone)));

        let mut drained = false;
        for _ in 0..250 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if disk.directory().ids().unwrap().is_empty()
                && balancer.state() == BalancerState::Stopped
            {
                drained = true;
                break;
            }
        }
        assert!(drained, "disk 2 was not drained");
        assert!(!ring.contains_disk(gone));
        for id in 0..50 {
            assert!(store.get(id).await.unwrap().is_some());
        }

        stop_tx.send(true).unwrap();
        watcher.await.unwrap();
    }
}
