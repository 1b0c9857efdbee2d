//! Staging area for block proposals and receipts not yet on-chain
//!
//! Proposals are keyed by block index; receipts are pooled per block index
//! and deduplicated by digest. Both are shared between the network task and
//! the scheduler, hence DashMap. A pooled receipt only counts as a vote when
//! its key belongs to one of the slot's voters, once per wallet.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use pchain_types::{BlockPayload, CryptoProvider, Receipt, Vote};

use crate::ledger_store::LedgerRead;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StagingError {
    #[error("payload hash {claimed} does not match block {index} contents")]
    HashMismatch { index: u64, claimed: String },

    #[error("receipt signature does not verify")]
    BadReceiptSignature,

    #[error("payload index {payload} disagrees with block index {block}")]
    IndexMismatch { payload: u64, block: u64 },

    #[error("no wallet on file for receipt key {0}")]
    UnknownVoter(String),

    #[error("{0} does not vote on this slot")]
    NotAVoter(String),
}

/// Agreeing votes (miner or valid) for `hash` at `index` among `receipts`,
/// counting each wallet in `voters` at most once. Receipts are assumed to be
/// signature-checked.
pub fn count_votes<'a>(
    receipts: impl IntoIterator<Item = &'a Receipt>,
    index: u64,
    hash: &str,
    ledger: &dyn LedgerRead,
    voters: &[String],
) -> usize {
    let mut counted = HashSet::new();
    for receipt in receipts {
        let data = &receipt.data;
        if data.block_index != index || data.block_hash != hash || data.vote == Vote::Invalid {
            continue;
        }
        let Some(wallet) = ledger.wallet_by_public_key(&receipt.public_key) else {
            continue;
        };
        if voters.contains(&wallet.wallet_address) {
            counted.insert(wallet.wallet_address.clone());
        }
    }
    counted.len()
}

pub struct StagingArea {
    proposals: DashMap<u64, BlockPayload>,
    receipts: DashMap<u64, Vec<Receipt>>,
    crypto: Arc<dyn CryptoProvider>,
}

impl StagingArea {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            proposals: DashMap::new(),
            receipts: DashMap::new(),
            crypto,
        }
    }

    /// Stage a proposal after checking its hash. Receipts riding along are
    /// pooled. A later proposal for the same index replaces the earlier one.
    pub fn stage_proposal(&self, payload: BlockPayload) -> Result<(), StagingError> {
        if payload.index != payload.data.index {
            return Err(StagingError::IndexMismatch {
                payload: payload.index,
                block: payload.data.index,
            });
        }
        if payload.data.compute_hash() != payload.hash {
            return Err(StagingError::HashMismatch {
                index: payload.index,
                claimed: payload.hash,
            });
        }
        for receipt in &payload.receipts {
            if let Err(e) = self.add_receipt(receipt.clone()) {
                tracing::debug!("dropping receipt attached to block {}: {}", payload.index, e);
            }
        }
        tracing::debug!("Staged proposal {} ({})", payload.index, payload.hash);
        self.proposals.insert(payload.index, payload);
        Ok(())
    }

    pub fn proposal(&self, index: u64) -> Option<BlockPayload> {
        self.proposals.get(&index).map(|p| p.value().clone())
    }

    pub fn discard_proposal(&self, index: u64) -> Option<BlockPayload> {
        self.proposals.remove(&index).map(|(_, p)| p)
    }

    /// Pool a verified receipt. Returns `Ok(false)` for a duplicate.
    pub fn add_receipt(&self, receipt: Receipt) -> Result<bool, StagingError> {
        if !receipt.verify(&*self.crypto) {
            return Err(StagingError::BadReceiptSignature);
        }
        let digest = receipt.digest();
        let mut pooled = self.receipts.entry(receipt.data.block_index).or_default();
        if pooled.iter().any(|r| r.digest() == digest) {
            return Ok(false);
        }
        pooled.push(receipt);
        Ok(true)
    }

    pub fn receipts_for(&self, index: u64) -> Vec<Receipt> {
        self.receipts
            .get(&index)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Agreeing votes pooled for `hash` at `index`, see [`count_votes`]
    pub fn vote_count(&self, index: u64, hash: &str, ledger: &dyn LedgerRead, voters: &[String]) -> usize {
        self.receipts
            .get(&index)
            .map(|pooled| count_votes(pooled.iter(), index, hash, ledger, voters))
            .unwrap_or(0)
    }

    /// Pooled receipts that no committed block includes yet, oldest block
    /// first, skipping receipts about `exclude_index`
    pub fn receipts_not_in_chain(&self, ledger: &dyn LedgerRead, exclude_index: u64) -> Vec<Receipt> {
        let mut indices: Vec<u64> = self
            .receipts
            .iter()
            .map(|e| *e.key())
            .filter(|i| *i != exclude_index)
            .collect();
        indices.sort_unstable();

        indices
            .into_iter()
            .flat_map(|i| self.receipts_for(i))
            .filter(|r| !ledger.receipt_included(&r.digest()))
            .collect()
    }

    /// Forget proposals and receipts for blocks below `index`
    pub fn prune_below(&self, index: u64) {
        self.proposals.retain(|i, _| *i >= index);
        self.receipts.retain(|i, _| *i >= index);
    }

    pub fn proposal_count(&self) -> usize {
        self.proposals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pchain_types::{Block, BlockBody, BlockStatus, Ed25519Provider, KeyPair, WalletRecord};
    use std::collections::BTreeMap;

    use crate::ledger_store::LedgerState;

    fn block(index: u64) -> Block {
        Block {
            index,
            timestamp: 1_000,
            status: BlockStatus::Normal,
            proof: 0,
            previous_hash: "prev".into(),
            creator_wallet: None,
            expected_miner: None,
            committee: vec![],
            body: BlockBody::default(),
        }
    }

    fn staging() -> StagingArea {
        StagingArea::new(Arc::new(Ed25519Provider))
    }

    fn ledger_with(keys: &[&KeyPair]) -> LedgerState {
        let mut ledger = LedgerState::new();
        for k in keys {
            ledger.insert_wallet(WalletRecord {
                wallet_address: k.address(),
                wallet_public: k.public_hex(),
                custodian_wallet: k.address(),
                kyc_docs: vec![],
                owner_type: 1,
                jurisdiction: 1,
                attributes: BTreeMap::new(),
            });
        }
        ledger
    }

    #[test]
    fn test_stage_checks_hash() {
        let staging = staging();
        let mut payload = BlockPayload::new(block(3), vec![]);
        assert!(staging.stage_proposal(payload.clone()).is_ok());
        assert_eq!(staging.proposal(3).unwrap(), payload);

        payload.hash = "forged".into();
        assert!(matches!(
            staging.stage_proposal(payload),
            Err(StagingError::HashMismatch { index: 3, .. })
        ));
    }

    #[test]
    fn test_receipts_are_verified_and_deduplicated() {
        let staging = staging();
        let keys = KeyPair::generate();
        let receipt = Receipt::new(&Ed25519Provider, &keys, Vote::Valid, 2, "h2");

        assert_eq!(staging.add_receipt(receipt.clone()), Ok(true));
        assert_eq!(staging.add_receipt(receipt.clone()), Ok(false));

        let mut forged = receipt;
        forged.data.block_hash = "other".into();
        assert_eq!(staging.add_receipt(forged), Err(StagingError::BadReceiptSignature));
        let ledger = ledger_with(&[&keys]);
        assert_eq!(staging.vote_count(2, "h2", &ledger, &[keys.address()]), 1);
    }

    #[test]
    fn test_only_slot_voters_count_once_each() {
        let staging = staging();
        let member = KeyPair::generate();
        let outsider = KeyPair::generate();
        let stranger = KeyPair::generate();
        let ledger = ledger_with(&[&member, &outsider]);
        let voters = vec![member.address()];

        // a miner receipt and a valid vote from the same wallet are one vote
        staging
            .add_receipt(Receipt::new(&Ed25519Provider, &member, Vote::Miner, 4, "h4"))
            .unwrap();
        staging
            .add_receipt(Receipt::new(&Ed25519Provider, &member, Vote::Valid, 4, "h4"))
            .unwrap();
        for keys in [&outsider, &stranger] {
            staging
                .add_receipt(Receipt::new(&Ed25519Provider, keys, Vote::Valid, 4, "h4"))
                .unwrap();
        }

        assert_eq!(staging.vote_count(4, "h4", &ledger, &voters), 1);
        assert_eq!(staging.vote_count(4, "other", &ledger, &voters), 0);
        let everyone = vec![member.address(), outsider.address(), stranger.address()];
        // the stranger has no wallet on file
        assert_eq!(staging.vote_count(4, "h4", &ledger, &everyone), 2);
    }

    #[test]
    fn test_receipts_not_in_chain() {
        let staging = staging();
        let keys = KeyPair::generate();
        let old = Receipt::new(&Ed25519Provider, &keys, Vote::Valid, 1, "h1");
        let fresh = Receipt::new(&Ed25519Provider, &keys, Vote::Valid, 2, "h2");
        let next = Receipt::new(&Ed25519Provider, &keys, Vote::Miner, 3, "h3");
        for r in [&old, &fresh, &next] {
            staging.add_receipt(r.clone()).unwrap();
        }

        let mut ledger = LedgerState::new();
        ledger.mark_receipt_included(&old.digest());

        assert_eq!(staging.receipts_not_in_chain(&ledger, 3), vec![fresh]);
    }

    #[test]
    fn test_prune_below() {
        let staging = staging();
        staging.stage_proposal(BlockPayload::new(block(1), vec![])).unwrap();
        staging.stage_proposal(BlockPayload::new(block(2), vec![])).unwrap();
        staging.prune_below(2);
        assert!(staging.proposal(1).is_none());
        assert_eq!(staging.proposal_count(), 1);
    }
}
