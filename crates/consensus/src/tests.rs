//! Test doubles shared by the scheduler and sync tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pchain_runtime::{ChainCore, ContractRegistry, LedgerState, LedgerStore};
use pchain_types::crypto::person_id_for_wallet;
use pchain_types::{
    BlockPayload, BlockRecord, BlockStatus, ChainParams, Clock, Ed25519Provider, KeyPair, MinerRecord, Person,
    Receipt, WalletRecord,
};

use crate::broadcast::PeerBroadcaster;
use crate::scheduler::Housekeeping;
use crate::sync::ChainSync;
use crate::types::{PeerMessage, SyncError};

pub(crate) const BASE_MS: i64 = 1_700_000_000_000;

/// Wall clock driven by tokio time, so paused tests move both together
pub(crate) struct TokioClock {
    base_ms: i64,
    start: tokio::time::Instant,
}

impl TokioClock {
    pub(crate) fn new(base_ms: i64) -> Self {
        Self {
            base_ms,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_corrected_ms(&self) -> i64 {
        self.base_ms + self.start.elapsed().as_millis() as i64
    }
}

pub(crate) fn node_keys(seed: u8) -> KeyPair {
    KeyPair::from_secret_bytes([seed; 32])
}

pub(crate) fn test_params(sentinel: &str) -> ChainParams {
    ChainParams {
        block_interval_ms: 1_000,
        global_tick_ms: 250,
        no_block_timeout_ms: 500,
        min_sync_interval_ms: 3_000,
        miner_broadcast_interval_ms: 60_000,
        committee_size: 1,
        minimum_acceptance_votes: 1,
        min_fee: 1,
        sentinel_node_wallet: sentinel.to_string(),
        ..ChainParams::default()
    }
}

/// Ledger with a wallet per node, optionally registered as miners last seen
/// at `miners_seen_at` and a first block stamped `genesis_ts`
pub(crate) fn seeded_ledger(nodes: &[&KeyPair], miners_seen_at: Option<i64>, genesis_ts: Option<i64>) -> LedgerState {
    let mut state = LedgerState::new();
    for (i, keys) in nodes.iter().enumerate() {
        add_wallet(&mut state, keys);
        let address = keys.address();
        if let Some(seen) = miners_seen_at {
            state.upsert_miner(MinerRecord {
                wallet_address: address,
                network_address: format!("10.0.0.{}:7000", i + 1),
                last_broadcast_timestamp: seen,
                block_index: 0,
            });
        }
    }
    if let Some(timestamp) = genesis_ts {
        state.record_block(BlockRecord {
            block_index: 1,
            hash: "genesis".into(),
            timestamp,
            status: BlockStatus::Normal,
            proof: 0,
            previous_hash: "0".into(),
            creator_wallet: None,
            expected_miner: None,
            committee: vec![],
            transaction_codes: vec![],
        });
    }
    state
}

/// Register a wallet, and the person behind it, without a miner record
pub(crate) fn add_wallet(state: &mut LedgerState, keys: &KeyPair) {
    let address = keys.address();
    state.insert_wallet(WalletRecord {
        wallet_address: address.clone(),
        wallet_public: keys.public_hex(),
        custodian_wallet: address.clone(),
        kyc_docs: vec![],
        owner_type: 1,
        jurisdiction: 1,
        attributes: BTreeMap::new(),
    });
    let person_id = person_id_for_wallet(&address);
    state.insert_person(Person {
        person_id: person_id.clone(),
        created_time: BASE_MS,
    });
    state.link_wallet(&person_id, &address);
}

pub(crate) fn build_core(keys: KeyPair, params: ChainParams, state: LedgerState, clock: Arc<dyn Clock>) -> ChainCore {
    ChainCore::new(
        Arc::new(params),
        LedgerStore::from_state(state),
        Arc::new(ContractRegistry::new()),
        Arc::new(Ed25519Provider),
        clock,
        keys,
    )
}

/// Broadcaster that records instead of sending
#[derive(Default)]
pub(crate) struct RecordingBroadcaster {
    peers: Vec<String>,
    /// How long each send takes before it is recorded
    delay: Duration,
    sent: Mutex<Vec<(PeerMessage, Vec<String>)>>,
}

impl RecordingBroadcaster {
    pub(crate) fn with_peers(peers: &[&str]) -> Self {
        Self {
            peers: peers.iter().map(|p| p.to_string()).collect(),
            delay: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn slow(peers: &[&str], delay: Duration) -> Self {
        Self {
            delay,
            ..Self::with_peers(peers)
        }
    }

    pub(crate) fn sent(&self) -> Vec<(PeerMessage, Vec<String>)> {
        self.sent.lock().clone()
    }

    pub(crate) fn blocks(&self) -> Vec<BlockPayload> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(m, _)| match m {
                PeerMessage::Block(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn receipts(&self) -> Vec<Receipt> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(m, _)| match m {
                PeerMessage::Receipt(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PeerBroadcaster for RecordingBroadcaster {
    async fn send(&self, message: PeerMessage, targets: &[String]) -> usize {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.sent.lock().push((message, targets.to_vec()));
        if targets.is_empty() {
            self.peers.len()
        } else {
            targets.len()
        }
    }

    fn peers(&self) -> Vec<String> {
        self.peers.clone()
    }
}

/// Sync that counts requests. By default nobody is there to answer.
#[derive(Default)]
pub(crate) struct CountingSync {
    pub(crate) calls: AtomicUsize,
    peers: usize,
}

impl CountingSync {
    pub(crate) fn answering(peers: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            peers,
        }
    }
}

#[async_trait]
impl ChainSync for CountingSync {
    async fn sync_from_peers(&self, _last_block_index: u64) -> Result<usize, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.peers {
            0 => Err(SyncError::NoPeers),
            peers => Ok(peers),
        }
    }
}

#[derive(Default)]
pub(crate) struct CountingHousekeeping {
    pub(crate) runs: AtomicUsize,
}

#[async_trait]
impl Housekeeping for CountingHousekeeping {
    async fn run(&self, _last_block_index: u64) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}
