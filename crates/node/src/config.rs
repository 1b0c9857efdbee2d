//! Node Configuration
//!
//! Settings come from an optional TOML file; command line flags override
//! whatever the file says.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use pchain_runtime::SNAPSHOT_EVERY_BLOCKS;
use pchain_types::{KeyPair, Network};

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Which network's constants to run with
    pub network: Network,
    /// Directory holding the ledger snapshot
    pub data_dir: PathBuf,
    /// Peer network bind address
    pub listen_addr: String,
    /// Address other nodes reach this one at, advertised in miner broadcasts
    pub public_address: Option<String>,
    /// Peers to dial at startup
    pub peers: Vec<String>,
    /// File with this node's hex encoded secret key
    pub key_file: PathBuf,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Commit own blocks without waiting for committee votes
    pub self_commit: bool,
    /// Save the ledger every N blocks
    pub snapshot_every_blocks: u64,
    /// Keep every committed block for serving syncs
    pub full_node: bool,
    /// Blocks kept for syncing peers when not a full node
    pub archive_keep_blocks: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Devnet,
            data_dir: PathBuf::from("./data"),
            listen_addr: "0.0.0.0:8182".to_string(),
            public_address: None,
            peers: Vec::new(),
            key_file: PathBuf::from("./data/node.key"),
            log_level: "info".to_string(),
            self_commit: false,
            snapshot_every_blocks: SNAPSHOT_EVERY_BLOCKS,
            full_node: false,
            archive_keep_blocks: 1_000,
        }
    }
}

impl NodeConfig {
    /// Read `path` if given, otherwise start from defaults
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {:?}", path))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn public_address(&self) -> String {
        self.public_address.clone().unwrap_or_else(|| self.listen_addr.clone())
    }

    /// Load the node key, generating and saving a fresh one on first run
    pub fn load_or_create_key(&self) -> anyhow::Result<KeyPair> {
        if self.key_file.exists() {
            let secret = std::fs::read_to_string(&self.key_file)
                .with_context(|| format!("reading key file {:?}", self.key_file))?;
            let keys = KeyPair::from_secret_hex(secret.trim()).context("key file is not a hex secret")?;
            return Ok(keys);
        }

        let keys = KeyPair::generate();
        if let Some(parent) = self.key_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.key_file, keys.secret_hex())
            .with_context(|| format!("writing key file {:?}", self.key_file))?;
        tracing::info!("Generated new node key at {:?}", self.key_file);
        Ok(keys)
    }
}
