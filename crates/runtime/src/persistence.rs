//! Persistence layer for the ledger
//!
//! Uses the sled embedded database to keep ledger snapshots across restarts.
//! One tree per table; keys are bincode encoded, rows are JSON because they
//! carry free-form attribute maps. Snapshots are written every few blocks and
//! on shutdown. Committed block payloads go to their own tree as they are
//! committed, keyed by big-endian index, so a restarted node can still serve
//! syncing peers.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sled::{Batch, Db};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use pchain_types::BlockPayload;

use crate::ledger_store::{LedgerRead, LedgerState, LedgerStore};

const WALLETS: &str = "wallets";
const PERSONS: &str = "persons";
const PERSON_WALLET: &str = "person_wallet";
const DAO_MEMBERSHIP: &str = "dao_membership";
const TOKENS: &str = "tokens";
const BALANCES: &str = "balances";
const TRANSACTIONS: &str = "transactions";
const BLOCKS: &str = "blocks";
const TRUST_SCORES: &str = "trust_scores";
const MINERS: &str = "miners";
const STAKES: &str = "stake_ledger";
const CONTRACTS: &str = "contracts";
const RECEIPTS: &str = "receipts";
const ARCHIVE: &str = "archive";

/// Metadata about the saved chain
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainMetadata {
    /// Last committed block index
    pub last_block_index: u64,
    /// Hash of the last committed block
    pub last_block_hash: String,
    /// Rows written across all tables
    pub row_count: u64,
    /// Last save timestamp (unix millis)
    pub last_save_ts: i64,
}

/// Persistent storage for ledger snapshots
pub struct PersistentStore {
    /// Sled database instance
    db: Db,
    /// Metadata tree
    metadata: sled::Tree,
}

impl PersistentStore {
    /// Open or create a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let db = sled::open(&path)?;
        let metadata = db.open_tree("metadata")?;

        tracing::info!("Opened persistent store at {:?}", path.as_ref());

        Ok(Self { db, metadata })
    }

    fn write_table<K: Serialize, V: Serialize>(&self, name: &str, rows: &BTreeMap<K, V>) -> anyhow::Result<usize> {
        let tree = self.db.open_tree(name)?;
        tree.clear()?;
        let mut batch = Batch::default();
        for (key, value) in rows {
            batch.insert(bincode::serialize(key)?, serde_json::to_vec(value)?);
        }
        tree.apply_batch(batch)?;
        Ok(rows.len())
    }

    fn write_set<K: Serialize>(&self, name: &str, keys: &BTreeSet<K>) -> anyhow::Result<usize> {
        let tree = self.db.open_tree(name)?;
        tree.clear()?;
        let mut batch = Batch::default();
        for key in keys {
            batch.insert(bincode::serialize(key)?, Vec::new());
        }
        tree.apply_batch(batch)?;
        Ok(keys.len())
    }

    fn read_table<K, V>(&self, name: &str) -> anyhow::Result<BTreeMap<K, V>>
    where
        K: DeserializeOwned + Ord,
        V: DeserializeOwned,
    {
        let tree = self.db.open_tree(name)?;
        let mut rows = BTreeMap::new();
        for result in tree.iter() {
            let (key, value) = result?;
            rows.insert(bincode::deserialize(&key)?, serde_json::from_slice(&value)?);
        }
        Ok(rows)
    }

    fn read_set<K: DeserializeOwned + Ord>(&self, name: &str) -> anyhow::Result<BTreeSet<K>> {
        let tree = self.db.open_tree(name)?;
        let mut keys = BTreeSet::new();
        for result in tree.iter() {
            let (key, _) = result?;
            keys.insert(bincode::deserialize(&key)?);
        }
        Ok(keys)
    }

    /// Write every table of `state`, replacing what was stored
    pub fn store_state(&self, state: &LedgerState) -> anyhow::Result<usize> {
        let mut count = 0;
        count += self.write_table(WALLETS, &state.wallets)?;
        count += self.write_table(PERSONS, &state.persons)?;
        count += self.write_table(PERSON_WALLET, &state.person_wallet)?;
        count += self.write_set(DAO_MEMBERSHIP, &state.dao_membership)?;
        count += self.write_table(TOKENS, &state.tokens)?;
        count += self.write_table(BALANCES, &state.balances)?;
        count += self.write_table(TRANSACTIONS, &state.transactions)?;
        count += self.write_table(BLOCKS, &state.blocks)?;
        count += self.write_table(TRUST_SCORES, &state.trust_scores)?;
        count += self.write_table(MINERS, &state.miners)?;
        count += self.write_table(STAKES, &state.stakes)?;
        count += self.write_table(CONTRACTS, &state.contracts)?;
        count += self.write_set(RECEIPTS, &state.receipts)?;
        Ok(count)
    }

    /// Read every table back into a fresh state
    pub fn load_state(&self) -> anyhow::Result<LedgerState> {
        Ok(LedgerState {
            wallets: self.read_table(WALLETS)?,
            persons: self.read_table(PERSONS)?,
            person_wallet: self.read_table(PERSON_WALLET)?,
            dao_membership: self.read_set(DAO_MEMBERSHIP)?,
            tokens: self.read_table(TOKENS)?,
            balances: self.read_table(BALANCES)?,
            transactions: self.read_table(TRANSACTIONS)?,
            blocks: self.read_table(BLOCKS)?,
            trust_scores: self.read_table(TRUST_SCORES)?,
            miners: self.read_table(MINERS)?,
            stakes: self.read_table(STAKES)?,
            contracts: self.read_table(CONTRACTS)?,
            receipts: self.read_set(RECEIPTS)?,
            ..LedgerState::default()
        })
    }

    /// Add one committed payload to the block archive
    pub fn store_archived_block(&self, payload: &BlockPayload) -> anyhow::Result<()> {
        let tree = self.db.open_tree(ARCHIVE)?;
        tree.insert(payload.index.to_be_bytes(), serde_json::to_vec(payload)?)?;
        Ok(())
    }

    /// Every archived payload by index
    pub fn load_archive(&self) -> anyhow::Result<BTreeMap<u64, BlockPayload>> {
        let tree = self.db.open_tree(ARCHIVE)?;
        let mut archive = BTreeMap::new();
        for result in tree.iter() {
            let (key, value) = result?;
            let index = u64::from_be_bytes(key.as_ref().try_into()?);
            archive.insert(index, serde_json::from_slice(&value)?);
        }
        Ok(archive)
    }

    /// Drop archived payloads below `index`
    pub fn prune_archive_below(&self, index: u64) -> anyhow::Result<usize> {
        let tree = self.db.open_tree(ARCHIVE)?;
        let mut batch = Batch::default();
        let mut removed = 0;
        for result in tree.range(..index.to_be_bytes()) {
            let (key, _) = result?;
            batch.remove(key);
            removed += 1;
        }
        tree.apply_batch(batch)?;
        Ok(removed)
    }

    /// Save chain metadata
    pub fn save_metadata(&self, metadata: &ChainMetadata) -> anyhow::Result<()> {
        let bytes = bincode::serialize(metadata)?;
        self.metadata.insert("chain", bytes)?;
        Ok(())
    }

    /// Load chain metadata
    pub fn load_metadata(&self) -> anyhow::Result<Option<ChainMetadata>> {
        match self.metadata.get("chain")? {
            Some(bytes) => {
                let metadata: ChainMetadata = bincode::deserialize(&bytes)?;
                Ok(Some(metadata))
            }
            None => Ok(None),
        }
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Extension trait to add persistence to the ledger store
pub trait LedgerPersistence {
    /// Save the committed ledger to persistent storage
    fn save_to_disk(&self, store: &PersistentStore) -> anyhow::Result<usize>;

    /// Replace the in-memory ledger with the saved snapshot
    fn load_from_disk(&self, store: &PersistentStore) -> anyhow::Result<usize>;
}

impl LedgerPersistence for LedgerStore {
    fn save_to_disk(&self, store: &PersistentStore) -> anyhow::Result<usize> {
        let state = self.read().clone();
        let count = store.store_state(&state)?;

        let (last_block_index, last_block_hash) = state
            .last_block()
            .map(|b| (b.block_index, b.hash.clone()))
            .unwrap_or_default();
        let last_save_ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        store.save_metadata(&ChainMetadata {
            last_block_index,
            last_block_hash,
            row_count: count as u64,
            last_save_ts,
        })?;

        store.flush()?;
        tracing::info!("Saved {} ledger rows to disk (block {})", count, last_block_index);

        Ok(count)
    }

    fn load_from_disk(&self, store: &PersistentStore) -> anyhow::Result<usize> {
        let state = store.load_state()?;
        let count = state.table_sizes().iter().map(|(_, n)| n).sum();
        let last = state.last_block_index();
        self.restore(state);

        tracing::info!("Loaded {} ledger rows from disk (block {})", count, last);

        Ok(count)
    }
}
