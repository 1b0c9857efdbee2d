//! Pending-transaction pool
//!
//! Entries are kept in (timestamp, code) order, which is the order the block
//! proposer walks them. Other tasks submit through a bounded channel
//! ([`MempoolSender`]); the owner drains it with [`Mempool::drain_channel`],
//! running the validator on every arrival.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use pchain_types::{SignedTransaction, ValidationError};

use crate::ledger_store::LedgerRead;
use crate::tx_validator::TransactionValidator;

/// Capacity of the submission channel
pub const SUBMISSION_CHANNEL_CAPACITY: usize = 1024;

type PoolKey = (i64, String);

#[derive(Default)]
struct PoolInner {
    ordered: BTreeMap<PoolKey, SignedTransaction>,
    /// code -> timestamp
    by_code: HashMap<String, i64>,
}

/// Handle for submitting transactions to the mempool
#[derive(Clone)]
pub struct MempoolSender {
    sender: Sender<SignedTransaction>,
}

impl MempoolSender {
    /// Queue a transaction for admission
    pub fn send(&self, tx: SignedTransaction) -> Result<(), String> {
        self.sender
            .try_send(tx)
            .map_err(|e| format!("Failed to submit transaction: {}", e))
    }
}

pub struct Mempool {
    inner: Mutex<PoolInner>,
    tx_receiver: Receiver<SignedTransaction>,
    tx_sender: Sender<SignedTransaction>,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Self {
        let (tx_sender, tx_receiver) = bounded(SUBMISSION_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(PoolInner::default()),
            tx_receiver,
            tx_sender,
        }
    }

    pub fn sender(&self) -> MempoolSender {
        MempoolSender {
            sender: self.tx_sender.clone(),
        }
    }

    /// Insert without validation. Returns `false` for a code already pooled.
    pub fn insert(&self, tx: SignedTransaction) -> bool {
        let mut inner = self.inner.lock();
        let code = tx.code().to_string();
        if inner.by_code.contains_key(&code) {
            return false;
        }
        let timestamp = tx.transaction.timestamp;
        inner.by_code.insert(code.clone(), timestamp);
        inner.ordered.insert((timestamp, code), tx);
        true
    }

    /// Validate and pool `tx`. Transactions already on-chain or already
    /// pooled are refused.
    pub fn admit(&self, tx: SignedTransaction, validator: &TransactionValidator, ledger: &dyn LedgerRead) -> Result<(), ValidationError> {
        if ledger.transaction_block(tx.code()).is_some() {
            return Err(ValidationError::AlreadyOnChain(tx.code().to_string()));
        }
        validator.validate(&tx, ledger).into_result()?;
        if !self.insert(tx) {
            tracing::debug!("transaction already pooled");
        }
        Ok(())
    }

    /// Admit everything waiting in the submission channel. Returns how many
    /// transactions were pooled.
    pub fn drain_channel(&self, validator: &TransactionValidator, ledger: &dyn LedgerRead) -> usize {
        let mut admitted = 0;
        loop {
            match self.tx_receiver.try_recv() {
                Ok(tx) => {
                    let code = tx.code().to_string();
                    match self.admit(tx, validator, ledger) {
                        Ok(()) => admitted += 1,
                        Err(reason) => tracing::warn!("Rejected transaction {}: {}", code, reason),
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        admitted
    }

    pub fn remove(&self, code: &str) -> Option<SignedTransaction> {
        let mut inner = self.inner.lock();
        let timestamp = inner.by_code.remove(code)?;
        inner.ordered.remove(&(timestamp, code.to_string()))
    }

    pub fn contains(&self, code: &str) -> bool {
        self.inner.lock().by_code.contains_key(code)
    }

    /// Copy of the pool in (timestamp, code) order
    pub fn snapshot(&self) -> Vec<SignedTransaction> {
        self.inner.lock().ordered.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries older than `max_age_ms` and entries already on-chain
    pub fn cleanup(&self, now_ms: i64, max_age_ms: i64, ledger: &dyn LedgerRead) -> usize {
        let cutoff = now_ms - max_age_ms;
        let mut inner = self.inner.lock();
        let stale: Vec<PoolKey> = inner
            .ordered
            .keys()
            .filter(|(ts, code)| *ts < cutoff || ledger.transaction_block(code).is_some())
            .cloned()
            .collect();
        for key in &stale {
            inner.ordered.remove(key);
            inner.by_code.remove(&key.1);
        }
        if !stale.is_empty() {
            tracing::debug!("Mempool cleanup dropped {} transactions", stale.len());
        }
        stale.len()
    }
}
