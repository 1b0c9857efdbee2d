//! Permissioned chain node
//!
//! Main entry point. Loads the ledger snapshot, joins the peer network and
//! runs the consensus scheduler until Ctrl+C. The ledger is saved every few
//! blocks and again on shutdown.

use anyhow::Result;
use clap::Parser;
use pchain_consensus::{ConsensusScheduler, PeerNetwork, PeerSync, SchedulerConfig};
use pchain_runtime::{ChainCore, ContractRegistry, LedgerPersistence, LedgerStore, PersistentStore};
use pchain_types::{ChainParams, Ed25519Provider, Network, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod housekeeping;

use config::NodeConfig;
use housekeeping::NodeHousekeeping;

/// Permissioned chain node
#[derive(Parser, Debug)]
#[command(name = "pchain-node")]
#[command(about = "Permissioned blockchain node with trust-weighted committee consensus", long_about = None)]
struct Args {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Network to join (devnet, testnet, mainnet)
    #[arg(long)]
    network: Option<Network>,

    /// Data directory for persistent state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Peer network bind address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Address advertised to other nodes
    #[arg(long)]
    public_address: Option<String>,

    /// Peer to connect to (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Node key file
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Commit own blocks without waiting for votes
    #[arg(long)]
    self_commit: bool,
}

impl Args {
    fn apply(self, mut config: NodeConfig) -> NodeConfig {
        if let Some(network) = self.network {
            config.network = network;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(listen_addr) = self.listen_addr {
            config.listen_addr = listen_addr;
        }
        if self.public_address.is_some() {
            config.public_address = self.public_address;
        }
        if !self.peers.is_empty() {
            config.peers = self.peers;
        }
        if let Some(key_file) = self.key_file {
            config.key_file = key_file;
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }
        config.self_commit |= self.self_commit;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = NodeConfig::load(args.config.as_deref())?;
    let config = args.apply(config);

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    run_node(config).await
}

async fn run_node(config: NodeConfig) -> Result<()> {
    let params = Arc::new(ChainParams::for_network(config.network));
    let keys = config.load_or_create_key()?;

    tracing::info!("Starting chain node on {:?}", config.network);
    tracing::info!("  Wallet: {}", keys.address());
    tracing::info!("  Listen: {} (advertised as {})", config.listen_addr, config.public_address());
    tracing::info!("  Peers: {:?}", config.peers);
    tracing::info!("  Data directory: {:?}", config.data_dir);
    tracing::info!("  Snapshot every {} blocks", config.snapshot_every_blocks);

    std::fs::create_dir_all(&config.data_dir)?;
    let persistence = Arc::new(PersistentStore::open(config.data_dir.join("ledger"))?);

    let store = LedgerStore::new();
    match persistence.load_metadata()? {
        Some(metadata) => {
            tracing::info!(
                "Loading ledger from disk: block {}, {} rows",
                metadata.last_block_index,
                metadata.row_count
            );
            store.load_from_disk(&persistence)?;
        }
        None => tracing::info!("No existing ledger found, starting fresh"),
    }

    let core = ChainCore::new(
        params.clone(),
        store,
        Arc::new(ContractRegistry::new()),
        Arc::new(Ed25519Provider),
        Arc::new(SystemClock::default()),
        keys,
    )
    .with_archive(persistence.clone())?;
    let core = Arc::new(core);

    // Peer network
    let (network, mut inbound) = PeerNetwork::new();
    let network = Arc::new(network);
    network.start(&config.listen_addr).await?;
    for peer in &config.peers {
        if let Err(e) = network.connect(peer).await {
            tracing::warn!("Could not reach peer {}: {}", peer, e);
        }
    }

    let archive_keep = (!config.full_node).then_some(config.archive_keep_blocks);
    let housekeeping = Arc::new(NodeHousekeeping::new(
        core.clone(),
        persistence.clone(),
        config.snapshot_every_blocks,
        archive_keep,
    ));
    let scheduler = ConsensusScheduler::new(
        core.clone(),
        network.clone(),
        Arc::new(PeerSync::new(network.clone())),
        housekeeping,
        SchedulerConfig::from_params(&params, config.self_commit, config.public_address()),
    );

    // Route peer traffic into the scheduler
    let inbound_scheduler = scheduler.clone();
    let inbound_handler = tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            if let Err(e) = inbound_scheduler.on_peer_message(message).await {
                tracing::warn!("Peer message rejected: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(scheduler.clone().run(shutdown_rx));

    tracing::info!("Node running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        tracing::error!("Scheduler task failed: {}", e);
    }
    inbound_handler.abort();

    let status = scheduler.status();
    tracing::info!("Saving final ledger at block {}...", status.last_block_index);
    match core.store().save_to_disk(&persistence) {
        Ok(rows) => tracing::info!("Final ledger saved: {} rows at block {}", rows, status.last_block_index),
        Err(e) => tracing::error!("Failed to save final ledger: {}", e),
    }

    let stats = network.stats();
    tracing::info!(
        "Node stopped: {} messages sent, {} received",
        stats.messages_sent,
        stats.messages_received
    );

    Ok(())
}
