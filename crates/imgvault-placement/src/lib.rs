//! ImgVault Placement - consistent hashing over weighted disks
//!
//! Every node builds the same ring from the same membership, so any node can
//! compute where an image id lives without asking anyone.
//!
//! # Example
//! ```ignore
//! use imgvault_placement::{Disk, HashRing, Node};
//!
//! let node = Node::new(1, "10.0.0.1", 7070).with_disk(Disk::new(1, "/data/d1", 1.0));
//! let ring = HashRing::build([node], 100);
//! let disk = ring.route_id(42)?;
//! let replicas = ring.route_replicas_id(42, 3)?;
//! ```

pub mod feed;
pub mod ring;
pub mod topology;

pub use feed::{LocalTopologyFeed, TopologyFeed};
pub use ring::{HashRing, hash_key, virtual_nodes};
pub use topology::{Disk, Node, Topology, TopologyEvent};
