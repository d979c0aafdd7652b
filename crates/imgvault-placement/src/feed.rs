//! Topology feed
//!
//! The feed is the node's view of cluster membership: a snapshot of every
//! node plus a stream of change events. Membership transport (a coordination
//! service) sits behind the [`TopologyFeed`] trait; [`LocalTopologyFeed`]
//! keeps everything in memory and is what a standalone node runs on.

use crate::topology::{Node, Topology, TopologyEvent};
use imgvault_common::NodeId;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 256;

/// Source of cluster membership
pub trait TopologyFeed: Send + Sync {
    /// Every node currently known, in id order
    fn snapshot(&self) -> Vec<Node>;

    /// Subscribe to subsequent change events
    fn subscribe(&self) -> broadcast::Receiver<TopologyEvent>;

    /// Identity of the node this process runs as
    fn local_node(&self) -> NodeId;

    /// Publish a node's balanced flag
    fn set_balanced(&self, node: NodeId, balanced: bool);
}

/// In-memory topology feed
pub struct LocalTopologyFeed {
    local: NodeId,
    topology: RwLock<Topology>,
    events: broadcast::Sender<TopologyEvent>,
}

impl LocalTopologyFeed {
    /// Create a feed seeded with `nodes`
    #[must_use]
    pub fn new(local: NodeId, nodes: impl IntoIterator<Item = Node>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            local,
            topology: RwLock::new(Topology::from_nodes(nodes)),
            events,
        }
    }

    /// Apply an event to the snapshot and publish it to subscribers
    ///
    /// Events referencing unknown members are dropped.
    pub fn publish(&self, event: TopologyEvent) -> bool {
        if !self.topology.write().apply(&event) {
            warn!("dropping topology event for unknown member: {event:?}");
            return false;
        }
        debug!("topology event: {event:?}");
        // No subscribers is fine
        let _ = self.events.send(event);
        true
    }

    /// Current topology version
    #[must_use]
    pub fn version(&self) -> u64 {
        self.topology.read().version
    }
}

impl TopologyFeed for LocalTopologyFeed {
    fn snapshot(&self) -> Vec<Node> {
        self.topology.read().nodes().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    fn local_node(&self) -> NodeId {
        self.local
    }

    fn set_balanced(&self, node: NodeId, balanced: bool) {
        self.publish(TopologyEvent::BalancedChanged(node, balanced));
    }
}
