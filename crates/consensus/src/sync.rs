//! Catch-up with peers
//!
//! A node that falls behind asks its peers for committed blocks past its
//! tip. Answers arrive as [`PeerMessage::SyncResponse`] through the inbound
//! channel and are applied by the scheduler in index order, each block only
//! once the voters its slot had on the local ledger have signed off on it.

use async_trait::async_trait;
use std::sync::Arc;

use pchain_runtime::{ApplyOutcome, ChainCore};
use pchain_types::BlockPayload;

use crate::broadcast::PeerBroadcaster;
use crate::selection::MinerSelection;
use crate::types::{PeerMessage, SyncError};

/// Blocks served per sync request
pub const SYNC_BATCH: usize = 100;

#[async_trait]
pub trait ChainSync: Send + Sync {
    /// Ask peers for blocks after `last_block_index`. Returns how many peers
    /// were asked.
    async fn sync_from_peers(&self, last_block_index: u64) -> Result<usize, SyncError>;
}

pub struct PeerSync {
    broadcaster: Arc<dyn PeerBroadcaster>,
}

impl PeerSync {
    pub fn new(broadcaster: Arc<dyn PeerBroadcaster>) -> Self {
        Self { broadcaster }
    }
}

#[async_trait]
impl ChainSync for PeerSync {
    async fn sync_from_peers(&self, last_block_index: u64) -> Result<usize, SyncError> {
        if self.broadcaster.peers().is_empty() {
            return Err(SyncError::NoPeers);
        }
        let from_index = last_block_index + 1;
        let asked = self
            .broadcaster
            .send(PeerMessage::SyncRequest { from_index }, &[])
            .await;
        tracing::info!("Requested blocks from {} at {} peers", from_index, asked);
        Ok(asked)
    }
}

/// Commit the blocks of a sync response that extend the local chain.
/// Stops at the first block that fails. Returns how many were applied.
pub fn apply_synced_blocks(
    core: &ChainCore,
    selection: &MinerSelection,
    mut blocks: Vec<BlockPayload>,
) -> Result<usize, SyncError> {
    blocks.sort_by_key(|p| p.index);
    let mut applied = 0;
    for payload in blocks {
        if payload.index <= core.store().last_block_index() {
            continue;
        }
        let roles = {
            let ledger = core.store().read();
            selection.select(&*ledger, core.trust())
        };
        match core.commit_synced(&payload, &core.voters(&roles))? {
            ApplyOutcome::Applied { index, .. } => {
                tracing::info!("Synced block {}", index);
                applied += 1;
            }
            ApplyOutcome::AlreadyApplied { .. } => {}
        }
    }
    Ok(applied)
}
