//! Per-tick node maintenance: ledger snapshots, mempool cleanup and archive
//! pruning

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use pchain_consensus::Housekeeping;
use pchain_runtime::{ChainCore, LedgerPersistence, PersistentStore};

pub struct NodeHousekeeping {
    core: Arc<ChainCore>,
    persistence: Arc<PersistentStore>,
    snapshot_every_blocks: u64,
    /// Archive depth kept for syncing peers, `None` keeps everything
    archive_keep_blocks: Option<u64>,
    last_snapshot: Arc<AtomicU64>,
    saving: Arc<AtomicBool>,
}

impl NodeHousekeeping {
    pub fn new(
        core: Arc<ChainCore>,
        persistence: Arc<PersistentStore>,
        snapshot_every_blocks: u64,
        archive_keep_blocks: Option<u64>,
    ) -> Self {
        let start = core.store().last_block_index();
        Self {
            core,
            persistence,
            snapshot_every_blocks,
            archive_keep_blocks,
            last_snapshot: Arc::new(AtomicU64::new(start)),
            saving: Arc::new(AtomicBool::new(false)),
        }
    }

    fn snapshot_due(&self, last_block_index: u64) -> bool {
        self.snapshot_every_blocks > 0
            && last_block_index >= self.last_snapshot.load(Ordering::SeqCst) + self.snapshot_every_blocks
    }

    /// Save in the background. Skipped while a previous save is running.
    fn spawn_snapshot(&self, last_block_index: u64) -> Option<tokio::task::JoinHandle<()>> {
        if self.saving.swap(true, Ordering::SeqCst) {
            return None;
        }
        let core = self.core.clone();
        let persistence = self.persistence.clone();
        let last_snapshot = self.last_snapshot.clone();
        let saving = self.saving.clone();

        Some(tokio::task::spawn_blocking(move || {
            match core.store().save_to_disk(&persistence) {
                Ok(rows) => {
                    last_snapshot.store(last_block_index, Ordering::SeqCst);
                    tracing::info!("Snapshot at block {} ({} rows)", last_block_index, rows);
                }
                Err(e) => tracing::error!("Failed to save snapshot at block {}: {}", last_block_index, e),
            }
            saving.store(false, Ordering::SeqCst);
        }))
    }
}

#[async_trait]
impl Housekeeping for NodeHousekeeping {
    async fn run(&self, last_block_index: u64) {
        if self.snapshot_due(last_block_index) {
            self.spawn_snapshot(last_block_index);
        }

        let dropped = self.core.cleanup_mempool();
        if dropped > 0 {
            tracing::info!("Dropped {} stale transactions from the mempool", dropped);
        }

        if let Some(keep) = self.archive_keep_blocks {
            let pruned = self.core.prune_archive(keep);
            if pruned > 0 {
                tracing::debug!("Pruned {} archived blocks", pruned);
            }
        }
    }
}
