//! Core types for the scheduler and the peer network

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pchain_runtime::ChainError;
use pchain_types::{BlockPayload, ChainParams, Receipt, SignedTransaction, ValidationError};

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PeerMessage {
    /// A proposed block with the receipts riding along
    Block(BlockPayload),

    /// One node's vote on a block
    Receipt(Receipt),

    /// A transaction to pool
    Transaction(SignedTransaction),

    /// Ask a peer for committed blocks starting at `from_index`
    SyncRequest { from_index: u64 },

    /// Committed blocks in index order
    SyncResponse { blocks: Vec<BlockPayload> },
}

impl PeerMessage {
    /// Serialize for network transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from network
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Where the scheduler stands in the current slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Idle,
    RoleCheck,
    Syncing,
    /// Expected miner, mining timer armed
    Mining,
    /// Neither miner nor committee, waiting for the block
    AwaitingBlock,
    /// Committee member, no-block timeout armed
    CommitteeWait,
    /// Sentinel covering for a missing miner
    SentinelFallback,
}

/// Timer and state snapshot for operators
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub is_mining: bool,
    pub is_waiting_block_timeout: bool,
    pub last_block_index: u64,
}

/// Scheduler timing, resolved from chain parameters
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_ms: i64,
    pub block_interval_ms: i64,
    pub no_block_timeout_ms: i64,
    pub min_sync_interval_ms: i64,
    pub miner_broadcast_interval_ms: i64,
    pub minimum_acceptance_votes: usize,
    pub sentinel_wallet: String,
    /// Commit own blocks right away instead of waiting for votes
    pub self_commit: bool,
    /// Address advertised in miner broadcasts
    pub public_address: String,
}

impl SchedulerConfig {
    pub fn from_params(params: &ChainParams, self_commit: bool, public_address: impl Into<String>) -> Self {
        Self {
            tick_ms: params.global_tick_ms,
            block_interval_ms: params.block_interval_ms,
            no_block_timeout_ms: params.no_block_timeout_ms,
            min_sync_interval_ms: params.min_sync_interval_ms,
            miner_broadcast_interval_ms: params.miner_broadcast_interval_ms,
            minimum_acceptance_votes: params.minimum_acceptance_votes,
            sentinel_wallet: params.sentinel_node_wallet.clone(),
            self_commit,
            public_address: public_address.into(),
        }
    }

    /// Chain considered stalled past this
    pub fn stall_after_ms(&self) -> i64 {
        self.block_interval_ms * 4
    }

    /// Expected miner stops arming its timer past this
    pub fn mining_window_ms(&self) -> i64 {
        self.block_interval_ms * 6
    }

    /// Sentinel mines an empty block past this
    pub fn sentinel_after_ms(&self) -> i64 {
        self.block_interval_ms * 8
    }

    /// Staged proposals older than this are discarded
    pub fn stale_proposal_ms(&self) -> i64 {
        self.block_interval_ms * 16
    }
}

/// Resync failures. Logged and retried on a later tick.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no peers to sync from")]
    NoPeers,

    #[error("peer {peer} failed: {reason}")]
    Peer { peer: String, reason: String },

    #[error(transparent)]
    Chain(#[from] ChainError),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("transaction rejected: {0}")]
    Rejected(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_message_wire_format() {
        let msg = PeerMessage::SyncRequest { from_index: 7 };
        let bytes = msg.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], "sync_request");
        assert_eq!(json["data"]["from_index"], 7);
        assert_eq!(PeerMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_windows_scale_with_interval() {
        let params = ChainParams {
            block_interval_ms: 1_000,
            ..ChainParams::default()
        };
        let config = SchedulerConfig::from_params(&params, false, "127.0.0.1:9000");
        assert_eq!(config.stall_after_ms(), 4_000);
        assert_eq!(config.mining_window_ms(), 6_000);
        assert_eq!(config.sentinel_after_ms(), 8_000);
        assert_eq!(config.stale_proposal_ms(), 16_000);
    }
}
