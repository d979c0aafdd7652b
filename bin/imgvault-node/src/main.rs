//! ImgVault node - image storage daemon
//!
//! Opens the local disks, starts periodic compaction and follows the
//! topology feed, rebalancing whenever membership or weights change.

use anyhow::{Context, Result};
use clap::Parser;
use imgvault_common::{Config, NodeId};
use imgvault_node::{Balancer, HttpTransfer, ImageStore, local_node, watch_topology};
use imgvault_placement::{HashRing, LocalTopologyFeed, TopologyFeed};
use imgvault_storage::Compactor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "imgvault-node")]
#[command(about = "ImgVault image storage node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/imgvault/node.toml")]
    config: PathBuf,

    /// Node id (overrides config)
    #[arg(long, env = "IMGVAULT_NODE_ID")]
    node_id: Option<u16>,

    /// Advertised address (overrides config)
    #[arg(long)]
    address: Option<String>,

    /// Advertised port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// Timeout for node-to-node transfers, in seconds
    #[arg(long, default_value = "30")]
    transfer_timeout: u64,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if args.config.exists() {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", args.config.display()))?
    } else {
        Config::default()
    };

    if let Some(id) = args.node_id {
        config.node.id = id;
    }
    if let Some(address) = &args.address {
        config.node.address.clone_from(address);
    }
    if let Some(port) = args.port {
        config.node.port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !args.config.exists() {
        warn!("config file {} not found, using defaults", args.config.display());
    }
    info!("Starting ImgVault node {}", config.node.id);
    info!("Config file: {}", args.config.display());
    info!(
        "Disks: {:?}",
        config.node.disks.iter().map(|d| &d.path).collect::<Vec<_>>()
    );

    let feed = Arc::new(LocalTopologyFeed::new(
        NodeId(config.node.id),
        [local_node(&config)],
    ));
    let ring = Arc::new(HashRing::build(feed.snapshot(), config.store.vnode_factor));
    let store = Arc::new(ImageStore::open(&config, Arc::clone(&ring))?);
    info!("Ring: {} nodes, {} positions", ring.node_count(), ring.len());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let compactor = Arc::new(Compactor::from_config(&config.store));
    let compaction = tokio::spawn(compactor.run(
        store.disks(),
        config.store.compact_period(),
        shutdown_rx.clone(),
    ));

    let transfer = HttpTransfer::new(Duration::from_secs(args.transfer_timeout))?;
    let balancer = Arc::new(Balancer::new(
        Arc::clone(&store),
        Arc::clone(&feed) as Arc<dyn TopologyFeed>,
        Arc::new(transfer),
    ));
    let watcher = tokio::spawn(watch_topology(
        Arc::clone(&feed) as Arc<dyn TopologyFeed>,
        Arc::clone(&ring),
        Arc::clone(&balancer),
        config.store.balance_delay(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down");

    shutdown_tx.send(true).ok();
    balancer.cancel().await;
    if let Err(e) = watcher.await {
        warn!("topology watcher ended abnormally: {e}");
    }
    if let Err(e) = compaction.await {
        warn!("compactor ended abnormally: {e}");
    }

    tokio::task::spawn_blocking(move || store.close()).await?;
    info!("ImgVault node stopped");
    Ok(())
}
