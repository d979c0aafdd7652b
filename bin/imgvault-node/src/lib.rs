//! ImgVault storage node
//!
//! Wires the storage engine to placement: the [`ImageStore`] routes requests
//! to local disks, the [`Balancer`] migrates ids after topology changes and
//! [`watch_topology`] keeps the ring current.

pub mod balancer;
pub mod store;
pub mod transfer;
pub mod watcher;

pub use balancer::{BalanceReport, Balancer, BalancerState};
pub use store::{Image, ImageStore, StoreOptions};
pub use transfer::{HttpTransfer, RemoteTransfer, TransferRequest};
pub use watcher::watch_topology;

use imgvault_common::Config;
use imgvault_placement::{Disk, Node};

/// Topology entry for the node described by `config`
#[must_use]
pub fn local_node(config: &Config) -> Node {
    let node = Node::new(config.node.id, config.node.address.clone(), config.node.port);
    config.node.disks.iter().fold(node, |node, disk| {
        let weight = disk.weight.unwrap_or(config.store.disk_default_weight);
        node.with_disk(Disk::new(disk.id, &disk.path, weight))
    })
}
