//! Cluster topology representation
//!
//! A [`Node`] owns its disks. Disks carry no pointer back to their node; the
//! pair `(node id, disk id)` ([`DiskKey`]) is the cluster-wide address and is
//! resolved through a node table when the owning node is needed.

use imgvault_common::{DiskId, DiskKey, Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Disk information
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    /// Disk identifier (unique within its node)
    pub id: DiskId,
    /// Directory holding the disk's volumes
    pub path: PathBuf,
    /// Weight for placement (share of the ring)
    pub weight: f64,
}

impl Disk {
    /// Create a disk description
    #[must_use]
    pub fn new(id: u16, path: impl Into<PathBuf>, weight: f64) -> Self {
        Self {
            id: DiskId(id),
            path: path.into(),
            weight,
        }
    }
}

/// Node information
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier
    pub id: NodeId,
    /// Network address other nodes use to reach this one
    pub address: String,
    /// Port other nodes use to reach this one
    pub port: u16,
    /// Whether the node has finished rebalancing against the current ring
    #[serde(default)]
    pub balanced: bool,
    /// Disks on this node
    #[serde(default)]
    pub disks: Vec<Disk>,
}

impl Node {
    /// Create a node with no disks
    #[must_use]
    pub fn new(id: u16, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: NodeId(id),
            address: address.into(),
            port,
            balanced: false,
            disks: Vec::new(),
        }
    }

    /// Builder-style disk registration
    #[must_use]
    pub fn with_disk(mut self, disk: Disk) -> Self {
        self.disks.push(disk);
        self
    }

    /// `address:port`
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Look up a disk by id
    #[must_use]
    pub fn disk(&self, id: DiskId) -> Option<&Disk> {
        self.disks.iter().find(|d| d.id == id)
    }

    /// Cluster-wide keys of every disk on this node
    pub fn disk_keys(&self) -> impl Iterator<Item = DiskKey> + '_ {
        self.disks.iter().map(|d| DiskKey::new(self.id, d.id))
    }

    /// Encode for publication on the topology feed
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a node published on the topology feed
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Discrete change notification delivered by the topology feed
#[derive(Clone, Debug, PartialEq)]
pub enum TopologyEvent {
    NodeAdded(Node),
    NodeRemoved(NodeId),
    DiskAdded(NodeId, Disk),
    DiskRemoved(DiskKey),
    WeightChanged(DiskKey, f64),
    BalancedChanged(NodeId, bool),
}

impl TopologyEvent {
    /// Membership and weight changes move data; balance flags do not
    #[must_use]
    pub const fn triggers_balance(&self) -> bool {
        !matches!(self, Self::BalancedChanged(..))
    }
}

/// Snapshot of every known node, keyed by id
#[derive(Clone, Debug, Default)]
pub struct Topology {
    /// Version number (incremented on changes)
    pub version: u64,
    nodes: BTreeMap<NodeId, Node>,
}

impl Topology {
    /// Create a new empty topology
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a node list
    #[must_use]
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut topology = Self::new();
        for node in nodes {
            topology.upsert_node(node);
        }
        topology
    }

    /// All nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Get a specific node by ID
    #[must_use]
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Add or update a node
    pub fn upsert_node(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
        self.version += 1;
    }

    /// Remove a node
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let removed = self.nodes.remove(&id);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    /// Apply an event; returns `false` if it referenced an unknown member
    pub fn apply(&mut self, event: &TopologyEvent) -> bool {
        let applied = match event {
            TopologyEvent::NodeAdded(node) => {
                self.nodes.insert(node.id, node.clone());
                true
            }
            TopologyEvent::NodeRemoved(id) => self.nodes.remove(id).is_some(),
            TopologyEvent::DiskAdded(node_id, disk) => match self.nodes.get_mut(node_id) {
                Some(node) => {
                    node.disks.retain(|d| d.id != disk.id);
                    node.disks.push(disk.clone());
                    true
                }
                None => false,
            },
            TopologyEvent::DiskRemoved(key) => match self.nodes.get_mut(&key.node) {
                Some(node) => {
                    let before = node.disks.len();
                    node.disks.retain(|d| d.id != key.disk);
                    node.disks.len() != before
                }
                None => false,
            },
            TopologyEvent::WeightChanged(key, weight) => self
                .nodes
                .get_mut(&key.node)
                .and_then(|n| n.disks.iter_mut().find(|d| d.id == key.disk))
                .map(|d| d.weight = *weight)
                .is_some(),
            TopologyEvent::BalancedChanged(id, balanced) => self
                .nodes
                .get_mut(id)
                .map(|n| n.balanced = *balanced)
                .is_some(),
        };
        if applied {
            self.version += 1;
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u16) -> Node {
        Node::new(id, "127.0.0.1", 7000 + id)
            .with_disk(Disk::new(1, format!("/data/{id}/d1"), 1.0))
            .with_disk(Disk::new(2, format!("/data/{id}/d2"), 2.0))
    }

    #[test]
    fn test_topology_add_node() {
        let mut topology = Topology::new();
        topology.upsert_node(node(1));

        assert_eq!(topology.version, 1);
        assert!(topology.get_node(NodeId(1)).is_some());
        assert_eq!(topology.get_node(NodeId(1)).unwrap().endpoint(), "127.0.0.1:7001");
    }

    #[test]
    fn test_wire_round_trip_has_no_back_references() {
        let n = node(4);
        let bytes = n.to_wire().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json["disks"][0].get("node").is_none());

        let decoded = Node::from_wire(&bytes).unwrap();
        assert_eq!(decoded, n);
        let keys: Vec<_> = decoded.disk_keys().collect();
        assert_eq!(keys, vec![
            DiskKey::new(NodeId(4), DiskId(1)),
            DiskKey::new(NodeId(4), DiskId(2)),
        ]);
    }

    #[test]
    fn test_apply_events() {
        let mut topology = Topology::from_nodes([node(1), node(2)]);
        let key = DiskKey::new(NodeId(1), DiskId(2));

        assert!(topology.apply(&TopologyEvent::WeightChanged(key, 5.0)));
        assert_eq!(topology.get_node(NodeId(1)).unwrap().disk(DiskId(2)).unwrap().weight, 5.0);

        assert!(topology.apply(&TopologyEvent::DiskRemoved(key)));
        assert!(topology.get_node(NodeId(1)).unwrap().disk(DiskId(2)).is_none());
        assert!(!topology.apply(&TopologyEvent::DiskRemoved(key)));

        assert!(topology.apply(&TopologyEvent::BalancedChanged(NodeId(2), true)));
        assert!(topology.get_node(NodeId(2)).unwrap().balanced);

        assert!(topology.apply(&TopologyEvent::NodeRemoved(NodeId(2))));
        assert_eq!(topology.nodes().count(), 1);
        assert!(!topology.apply(&TopologyEvent::DiskAdded(NodeId(9), Disk::new(1, "/x", 1.0))));
    }

    #[test]
    fn test_balance_triggering_events() {
        assert!(TopologyEvent::NodeRemoved(NodeId(1)).triggers_balance());
        assert!(!TopologyEvent::BalancedChanged(NodeId(1), true).triggers_balance());
    }
}
