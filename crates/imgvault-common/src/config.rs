//! Configuration types for ImgVault
//!
//! All structures deserialize from TOML with per-field defaults so a config
//! file only needs to name what it overrides.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a storage node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and disks
    #[serde(default)]
    pub node: NodeConfig,
    /// Storage engine tuning
    #[serde(default)]
    pub store: StoreConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        let mut seen = std::collections::HashSet::new();
        for disk in &self.node.disks {
            if !seen.insert(disk.id) {
                return Err(Error::Configuration(format!(
                    "duplicate disk id {} on node {}",
                    disk.id, self.node.id
                )));
            }
            if let Some(weight) = disk.weight
                && !(weight.is_finite() && weight >= 0.0)
            {
                return Err(Error::Configuration(format!(
                    "disk {} has invalid weight {weight}",
                    disk.id
                )));
            }
        }
        Ok(())
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Numeric node id (unique within the cluster)
    #[serde(default)]
    pub id: u16,
    /// Address other nodes use to reach this node
    #[serde(default = "default_address")]
    pub address: String,
    /// Port other nodes use to reach this node
    #[serde(default = "default_port")]
    pub port: u16,
    /// Disks owned by this node
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            address: default_address(),
            port: default_port(),
            disks: Vec::new(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    7070
}

/// Configuration for a single disk
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Disk id (unique within the node)
    pub id: u16,
    /// Directory holding volume files and the directory database
    pub path: PathBuf,
    /// Placement weight; falls back to `store.disk_default_weight`
    #[serde(default)]
    pub weight: Option<f64>,
}

/// Storage engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Virtual nodes per unit of disk weight
    #[serde(default = "default_vnode_factor")]
    pub vnode_factor: u32,
    /// Weight for disks that do not set one
    #[serde(default = "default_disk_weight")]
    pub disk_default_weight: f64,
    /// Volume rotation threshold in bytes
    #[serde(default = "default_volume_max_size")]
    pub volume_max_size: u64,
    /// Live-space fraction below which a volume is compacted
    #[serde(default = "default_compact_threshold")]
    pub volume_compact_threshold: f64,
    /// Compaction period in seconds
    #[serde(default = "default_compact_period")]
    pub volume_compact_period: u64,
    /// Number of replicas per image
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u8,
    /// Maximum image payload size in bytes
    #[serde(default = "default_image_max_size")]
    pub image_max_size: usize,
    /// Delay before a triggered balance run starts, in seconds
    #[serde(default = "default_balance_delay")]
    pub balance_delay: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            vnode_factor: default_vnode_factor(),
            disk_default_weight: default_disk_weight(),
            volume_max_size: default_volume_max_size(),
            volume_compact_threshold: default_compact_threshold(),
            volume_compact_period: default_compact_period(),
            replication_factor: default_replication_factor(),
            image_max_size: default_image_max_size(),
            balance_delay: default_balance_delay(),
        }
    }
}

impl StoreConfig {
    /// Compaction period as a `Duration`
    #[must_use]
    pub const fn compact_period(&self) -> Duration {
        Duration::from_secs(self.volume_compact_period)
    }

    /// Balance delay as a `Duration`
    #[must_use]
    pub const fn balance_delay(&self) -> Duration {
        Duration::from_secs(self.balance_delay)
    }

    /// Dead bytes above which a volume becomes a compaction candidate
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn compact_dead_bytes(&self) -> u64 {
        (self.volume_max_size as f64 * (1.0 - self.volume_compact_threshold)) as u64
    }

    /// Validate ranges
    pub fn validate(&self) -> Result<()> {
        if self.vnode_factor == 0 {
            return Err(Error::Configuration("vnode_factor must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.volume_compact_threshold) {
            return Err(Error::Configuration(format!(
                "volume_compact_threshold must be within [0, 1], got {}",
                self.volume_compact_threshold
            )));
        }
        if self.volume_max_size == 0 {
            return Err(Error::Configuration("volume_max_size must be > 0".into()));
        }
        if self.replication_factor == 0 {
            return Err(Error::Configuration("replication_factor must be > 0".into()));
        }
        if !(self.disk_default_weight.is_finite() && self.disk_default_weight >= 0.0) {
            return Err(Error::Configuration(format!(
                "disk_default_weight must be >= 0, got {}",
                self.disk_default_weight
            )));
        }
        Ok(())
    }
}

const fn default_vnode_factor() -> u32 {
    100
}

const fn default_disk_weight() -> f64 {
    1.0
}

const fn default_volume_max_size() -> u64 {
    64 * 1024 * 1024 // 64 MB
}

const fn default_compact_threshold() -> f64 {
    0.8
}

const fn default_compact_period() -> u64 {
    60 * 60 // 1 hour
}

const fn default_replication_factor() -> u8 {
    1
}

const fn default_image_max_size() -> usize {
    1024 * 1024 // 1 MB
}

const fn default_balance_delay() -> u64 {
    10
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.vnode_factor, 100);
        assert_eq!(config.node.port, 7070);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_compact_dead_bytes() {
        let store = StoreConfig {
            volume_max_size: 1000,
            volume_compact_threshold: 0.75,
            ..Default::default()
        };
        assert_eq!(store.compact_dead_bytes(), 250);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = Config::default();
        config.store.volume_compact_threshold = 1.5;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_disks() {
        let mut config = Config::default();
        for _ in 0..2 {
            config.node.disks.push(DiskConfig {
                id: 1,
                path: PathBuf::from("/tmp/d1"),
                weight: None,
            });
        }
        assert!(config.validate().is_err());
    }
}
