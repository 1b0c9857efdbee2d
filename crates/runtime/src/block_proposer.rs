//! Block proposer
//!
//! Walks the mempool in (timestamp, code) order and builds a candidate block.
//! Every candidate transaction is screened against a scratch copy of the
//! ledger that already carries the effects of the transactions picked before
//! it, so fees and balances are checked cumulatively. Rejected transactions
//! are removed from the pool.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use pchain_types::constants::{EMPTY_BLOCK_PROOF, MAX_MINER_BLOCK_LAG, NETWORK_TOKEN_CODE};
use pchain_types::{
    Block, BlockBody, BlockStatus, ChainParams, Clock, SignedTransaction, Transaction,
    TransactionKind, ValidationError,
};

use crate::ledger_store::{LedgerRead, LedgerState};
use crate::mempool::Mempool;
use crate::staging::StagingArea;
use crate::state_transition::StateTransitionEngine;
use crate::tx_validator::{fee_debits, TransactionValidator};

/// Previous hash of the first block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Who is expected to mine a slot and who votes on it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotRoles {
    pub expected_miner: Option<String>,
    pub committee: Vec<String>,
}

impl SlotRoles {
    /// Wallets whose receipts count for the slot: the expected miner, the
    /// committee and the sentinel
    pub fn voters(&self, sentinel: &str) -> Vec<String> {
        let mut voters: Vec<String> = self
            .expected_miner
            .iter()
            .chain(self.committee.iter())
            .cloned()
            .collect();
        if !voters.iter().any(|v| v == sentinel) {
            voters.push(sentinel.to_string());
        }
        voters
    }
}

/// Why a pooled transaction was dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    #[error("{payer} cannot pay fee {fee}")]
    FeeUnpaid { payer: String, fee: i64 },

    #[error("economic check failed: {0}")]
    Economics(ValidationError),

    #[error("already on-chain")]
    AlreadyOnChain,

    #[error("miner broadcast is stale")]
    Stale,

    #[error("could not be applied: {0}")]
    Unappliable(String),
}

pub struct BlockProposer {
    params: Arc<ChainParams>,
    validator: Arc<TransactionValidator>,
    engine: Arc<StateTransitionEngine>,
    clock: Arc<dyn Clock>,
}

impl BlockProposer {
    pub fn new(
        params: Arc<ChainParams>,
        validator: Arc<TransactionValidator>,
        engine: Arc<StateTransitionEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            params,
            validator,
            engine,
            clock,
        }
    }

    /// Build the next block for `creator`, or `None` to abstain this tick
    pub fn propose(
        &self,
        ledger: &LedgerState,
        mempool: &Mempool,
        staging: &StagingArea,
        creator: &str,
        roles: &SlotRoles,
    ) -> Option<Block> {
        let now = self.clock.now_corrected_ms();
        let last = ledger.last_block();
        let index = last.map(|b| b.block_index + 1).unwrap_or(1);
        let cap = self.params.max_block_size;

        let transactions = self.select_transactions(ledger, mempool, creator, index, now);

        if transactions.is_empty() {
            if let Some(last) = last {
                let elapsed = now - last.timestamp;
                if elapsed < self.params.block_interval_ms {
                    tracing::info!("No transactions and only {}ms since block {}, not proposing", elapsed, last.block_index);
                    return None;
                }
            }
            tracing::info!("No transactions, proposing empty block {}", index);
        } else {
            tracing::info!("Found {} transactions for block {}", transactions.len(), index);
        }

        let receipts = if last.is_some() {
            let mut receipts = staging.receipts_not_in_chain(ledger, index);
            receipts.truncate(cap.saturating_sub(transactions.len()));
            receipts
        } else {
            Vec::new()
        };

        Some(Block {
            index,
            timestamp: now,
            status: BlockStatus::Normal,
            proof: 0,
            previous_hash: last
                .map(|b| b.hash.clone())
                .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_string()),
            creator_wallet: Some(creator.to_string()),
            expected_miner: roles.expected_miner.clone(),
            committee: roles.committee.clone(),
            body: BlockBody {
                transactions,
                previous_block_receipts: receipts,
            },
        })
    }

    /// Empty fallback block stamped `timestamp`: no creator, no body,
    /// sentinel proof marker
    pub fn propose_empty(&self, ledger: &dyn LedgerRead, status: BlockStatus, roles: &SlotRoles, timestamp: i64) -> Block {
        let last = ledger.last_block();
        Block {
            index: last.map(|b| b.block_index + 1).unwrap_or(1),
            timestamp,
            status,
            proof: EMPTY_BLOCK_PROOF,
            previous_hash: last
                .map(|b| b.hash.clone())
                .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_string()),
            creator_wallet: None,
            expected_miner: roles.expected_miner.clone(),
            committee: roles.committee.clone(),
            body: BlockBody::default(),
        }
    }

    fn select_transactions(
        &self,
        ledger: &LedgerState,
        mempool: &Mempool,
        creator: &str,
        index: u64,
        now: i64,
    ) -> Vec<SignedTransaction> {
        let cap = self.params.max_block_size;
        let last_index = ledger.last_block_index();
        let mut scratch = ledger.clone();
        let mut included: Vec<SignedTransaction> = Vec::new();
        let mut seen = HashSet::new();

        for signed in mempool.snapshot() {
            if included.len() >= cap {
                tracing::info!("Reached max block size, moving forward with the collected transactions");
                break;
            }
            let code = signed.code().to_string();
            if seen.contains(&code) {
                continue;
            }

            if let Err(reason) = self.screen(&scratch, &signed.transaction, now, last_index) {
                tracing::warn!("Dropping transaction {}: {}", code, reason);
                mempool.remove(&code);
                continue;
            }

            match self
                .engine
                .apply_transaction(&mut scratch, &signed.transaction, Some(creator), index)
            {
                Ok(_) => {
                    seen.insert(code);
                    included.push(signed);
                }
                Err(e) => {
                    tracing::warn!("Dropping transaction {}: {}", code, DropReason::Unappliable(e.to_string()));
                    mempool.remove(&code);
                    scratch = self.replay(ledger, &included, creator, index);
                }
            }
        }
        included
    }

    /// Rebuild the scratch ledger from the committed one
    fn replay(&self, ledger: &LedgerState, included: &[SignedTransaction], creator: &str, index: u64) -> LedgerState {
        let mut scratch = ledger.clone();
        for signed in included {
            if let Err(e) = self
                .engine
                .apply_transaction(&mut scratch, &signed.transaction, Some(creator), index)
            {
                tracing::error!("replaying {} on scratch ledger failed: {}", signed.code(), e);
            }
        }
        scratch
    }

    /// Inclusion rules, in order: fee payable, economics, not on-chain, fresh
    pub fn screen(&self, ledger: &dyn LedgerRead, tx: &Transaction, now: i64, last_index: u64) -> Result<(), DropReason> {
        let mut owed: BTreeMap<String, i64> = BTreeMap::new();
        for (payer, amount) in fee_debits(tx) {
            let total = owed.entry(payer.clone()).or_default();
            *total = total.checked_add(amount).ok_or_else(|| {
                DropReason::Economics(ValidationError::AmountOverflow {
                    wallet: payer,
                    token: NETWORK_TOKEN_CODE.to_string(),
                })
            })?;
        }
        for (payer, fee) in owed {
            if ledger.balance(&payer, NETWORK_TOKEN_CODE) < fee {
                return Err(DropReason::FeeUnpaid { payer, fee });
            }
        }

        self.validator
            .check_economics(tx, ledger)
            .map_err(DropReason::Economics)?;

        if ledger.transaction_block(&tx.code).is_some() {
            return Err(DropReason::AlreadyOnChain);
        }

        if let TransactionKind::MinerAddition(m) = &tx.kind {
            let too_old = m.broadcast_timestamp < now - self.params.miner_broadcast_interval_ms;
            let too_far_behind = m.last_block_index + MAX_MINER_BLOCK_LAG < last_index;
            if too_old || too_far_behind {
                return Err(DropReason::Stale);
            }
        }
        Ok(())
    }
}
