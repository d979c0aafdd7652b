//! Consistent-hashing ring with weighted virtual nodes
//!
//! # Algorithm
//!
//! For every disk, `unique = combine16(node id, disk id)` seeds a
//! deterministic PRNG which draws `round(weight * vnode_factor)` 32-bit
//! values. Each draw becomes the ring key `combine32(draw, unique)`. The low
//! half of a ring key is the disk's own id, so two disks can never claim the
//! same position, and the key set depends only on the disk set: building the
//! ring from the same nodes in any order yields the same ring.
//!
//! A key is routed by hashing it (xxh3-128 folded to 64 bits) and taking the
//! ceiling entry, wrapping to the first entry past the end.
//!
//! ```text
//!   0 ─────●────────●──────●────────────●───── u64::MAX
//!          d1/1     d2/1   d1/2         d3/1
//!                ▲
//!                hash(key) → ceiling → d2/1
//! ```

use crate::topology::{Disk, Node, TopologyEvent};
use imgvault_common::codec::combine32;
use imgvault_common::{DiskKey, Error, NodeId, Result};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use tracing::{debug, warn};

/// Hash a routing key to its ring position
#[must_use]
pub fn hash_key(key: &[u8]) -> u64 {
    let h = xxhash_rust::xxh3::xxh3_128(key);
    let (hi, lo) = ((h >> 64) as u64, h as u64);
    hi ^ lo
}

/// Ring positions owned by one disk
#[must_use]
pub fn virtual_nodes(key: DiskKey, weight: f64, vnode_factor: u32) -> BTreeSet<u64> {
    let unique = key.unique_id();
    let count = vnode_count(weight, vnode_factor);
    let mut rng = StdRng::seed_from_u64(u64::from(unique));
    (0..count).map(|_| combine32(rng.r#gen::<u32>(), unique)).collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn vnode_count(weight: f64, vnode_factor: u32) -> usize {
    if !weight.is_finite() || weight <= 0.0 {
        return 0;
    }
    (weight * f64::from(vnode_factor)).round() as usize
}

#[derive(Default)]
struct RingState {
    /// Ring position -> disk
    ring: BTreeMap<u64, DiskKey>,
    /// Disk -> its ring positions (for removal)
    vnodes: HashMap<DiskKey, BTreeSet<u64>>,
    /// Node table used to resolve `DiskKey`s
    nodes: HashMap<NodeId, Node>,
}

impl RingState {
    fn insert_disk(&mut self, key: DiskKey, weight: f64, vnode_factor: u32) {
        self.remove_disk_vnodes(key);
        let positions = virtual_nodes(key, weight, vnode_factor);
        for pos in &positions {
            self.ring.insert(*pos, key);
        }
        debug!("disk {key} placed with {} virtual nodes", positions.len());
        self.vnodes.insert(key, positions);
    }

    fn remove_disk_vnodes(&mut self, key: DiskKey) {
        if let Some(positions) = self.vnodes.remove(&key) {
            for pos in positions {
                self.ring.remove(&pos);
            }
        }
    }

    fn insert_node(&mut self, node: Node, vnode_factor: u32) {
        if self.nodes.contains_key(&node.id) {
            self.remove_node(node.id);
        }
        for disk in &node.disks {
            self.insert_disk(DiskKey::new(node.id, disk.id), disk.weight, vnode_factor);
        }
        self.nodes.insert(node.id, node);
    }

    fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        for key in node.disk_keys() {
            self.remove_disk_vnodes(key);
        }
        Some(node)
    }

    /// Iterate ring entries starting at the ceiling of `hash`, wrapping once
    fn walk_from(&self, hash: u64) -> impl Iterator<Item = (&u64, &DiskKey)> {
        self.ring
            .range((Bound::Included(hash), Bound::Unbounded))
            .chain(self.ring.range((Bound::Unbounded, Bound::Excluded(hash))))
    }

    fn live_node_count(&self) -> usize {
        self.vnodes
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.node)
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Consistent-hashing router
pub struct HashRing {
    vnode_factor: u32,
    state: RwLock<RingState>,
}

impl HashRing {
    /// Create an empty ring
    #[must_use]
    pub fn new(vnode_factor: u32) -> Self {
        Self {
            vnode_factor,
            state: RwLock::new(RingState::default()),
        }
    }

    /// Build a ring from a node list
    #[must_use]
    pub fn build(nodes: impl IntoIterator<Item = Node>, vnode_factor: u32) -> Self {
        let ring = Self::new(vnode_factor);
        ring.rebuild(nodes);
        ring
    }

    /// Replace the whole ring
    pub fn rebuild(&self, nodes: impl IntoIterator<Item = Node>) {
        let mut next = RingState::default();
        for node in nodes {
            next.insert_node(node, self.vnode_factor);
        }
        *self.state.write() = next;
    }

    /// Virtual nodes per unit weight
    #[must_use]
    pub const fn vnode_factor(&self) -> u32 {
        self.vnode_factor
    }

    /// Resolve a key to its primary disk
    pub fn route(&self, key: &[u8]) -> Result<DiskKey> {
        let hash = hash_key(key);
        let state = self.state.read();
        state
            .walk_from(hash)
            .next()
            .map(|(_, disk)| *disk)
            .ok_or(Error::EmptyRing)
    }

    /// Resolve an image id (hashed as 8 big-endian bytes)
    pub fn route_id(&self, id: i64) -> Result<DiskKey> {
        self.route(&id.to_be_bytes())
    }

    /// Resolve a key to up to `n` disks on pairwise-distinct nodes, in ring
    /// order starting from the primary
    pub fn route_replicas(&self, key: &[u8], n: usize) -> Result<Vec<DiskKey>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let hash = hash_key(key);
        let state = self.state.read();
        if state.ring.is_empty() {
            return Err(Error::EmptyRing);
        }

        let want = n.min(state.live_node_count());
        let mut selected: Vec<DiskKey> = Vec::with_capacity(want);
        for (_, disk) in state.walk_from(hash) {
            if selected.len() >= want {
                break;
            }
            if !selected.iter().any(|s| s.node == disk.node) {
                selected.push(*disk);
            }
        }
        Ok(selected)
    }

    /// Replica set for an image id
    pub fn route_replicas_id(&self, id: i64, n: usize) -> Result<Vec<DiskKey>> {
        self.route_replicas(&id.to_be_bytes(), n)
    }

    /// Add (or replace) a node and all its disks
    pub fn add_node(&self, node: Node) {
        self.state.write().insert_node(node, self.vnode_factor);
    }

    /// Remove a node and all its disks
    pub fn remove_node(&self, id: NodeId) -> Option<Node> {
        self.state.write().remove_node(id)
    }

    /// Add a disk to a known node
    pub fn add_disk(&self, node_id: NodeId, disk: Disk) -> Result<()> {
        let mut state = self.state.write();
        let key = DiskKey::new(node_id, disk.id);
        let weight = disk.weight;
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or(Error::NodeNotFound(node_id))?;
        node.disks.retain(|d| d.id != disk.id);
        node.disks.push(disk);
        state.insert_disk(key, weight, self.vnode_factor);
        Ok(())
    }

    /// Remove a disk
    pub fn remove_disk(&self, key: DiskKey) -> Result<Disk> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(&key.node)
            .ok_or(Error::NodeNotFound(key.node))?;
        let idx = node
            .disks
            .iter()
            .position(|d| d.id == key.disk)
            .ok_or(Error::DiskNotFound(key))?;
        let disk = node.disks.remove(idx);
        state.remove_disk_vnodes(key);
        Ok(disk)
    }

    /// Change a disk's weight: its virtual nodes are removed, then regenerated
    pub fn change_weight(&self, key: DiskKey, weight: f64) -> Result<()> {
        let mut state = self.state.write();
        let disk = state
            .nodes
            .get_mut(&key.node)
            .ok_or(Error::NodeNotFound(key.node))?
            .disks
            .iter_mut()
            .find(|d| d.id == key.disk)
            .ok_or(Error::DiskNotFound(key))?;
        disk.weight = weight;
        state.remove_disk_vnodes(key);
        state.insert_disk(key, weight, self.vnode_factor);
        Ok(())
    }

    /// Patch the ring for a topology event
    pub fn apply(&self, event: &TopologyEvent) -> Result<()> {
        match event {
            TopologyEvent::NodeAdded(node) => {
                self.add_node(node.clone());
                Ok(())
            }
            TopologyEvent::NodeRemoved(id) => {
                if self.remove_node(*id).is_none() {
                    warn!("removal of unknown node {id} ignored");
                }
                Ok(())
            }
            TopologyEvent::DiskAdded(node_id, disk) => self.add_disk(*node_id, disk.clone()),
            TopologyEvent::DiskRemoved(key) => self.remove_disk(*key).map(|_| ()),
            TopologyEvent::WeightChanged(key, weight) => self.change_weight(*key, *weight),
            TopologyEvent::BalancedChanged(id, balanced) => {
                if let Some(node) = self.state.write().nodes.get_mut(id) {
                    node.balanced = *balanced;
                }
                Ok(())
            }
        }
    }

    /// Look up a node in the router's node table
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.state.read().nodes.get(&id).cloned()
    }

    /// Look up a disk by key
    #[must_use]
    pub fn disk(&self, key: DiskKey) -> Option<Disk> {
        self.state
            .read()
            .nodes
            .get(&key.node)
            .and_then(|n| n.disk(key.disk).cloned())
    }

    /// Whether a disk currently owns ring positions
    #[must_use]
    pub fn contains_disk(&self, key: DiskKey) -> bool {
        self.state
            .read()
            .vnodes
            .get(&key)
            .is_some_and(|v| !v.is_empty())
    }

    /// All known nodes, in id order
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.state.read().nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Every disk with at least one ring position, in key order
    #[must_use]
    pub fn disks(&self) -> Vec<DiskKey> {
        let state = self.state.read();
        let mut keys: Vec<DiskKey> = state
            .vnodes
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| *k)
            .collect();
        keys.sort();
        keys
    }

    /// Number of nodes with at least one ring position
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.state.read().live_node_count()
    }

    /// Number of ring positions
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().ring.len()
    }

    /// True if no disk owns a ring position
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().ring.is_empty()
    }

    /// Ring positions in ascending order (for diagnostics and tests)
    #[must_use]
    pub fn positions(&self) -> Vec<(u64, DiskKey)> {
        self.state.read().ring.iter().map(|(k, v)| (*k, *v)).collect()
    }
}
