//! Chain core
//!
//! Ties the ledger, pool, staging area and the three block-level components
//! together behind the operations the scheduler drives: mine, mine an empty
//! fallback block, vote on a received proposal, commit and catch up from
//! synced blocks.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use pchain_types::{
    Block, BlockPayload, BlockRecord, BlockStatus, ChainParams, Clock, CryptoProvider, KeyPair,
    LedgerError, Receipt, SignedTransaction, Transaction, ValidationError, Vote,
};

use crate::block_proposer::{BlockProposer, SlotRoles};
use crate::contracts::ContractRegistry;
use crate::ledger_store::{LedgerRead, LedgerStore};
use crate::mempool::{Mempool, MempoolSender};
use crate::persistence::PersistentStore;
use crate::staging::{count_votes, StagingArea, StagingError};
use crate::state_transition::{ApplyOutcome, StateTransitionEngine};
use crate::trust::TrustScoreManager;
use crate::tx_validator::TransactionValidator;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("block {index} rejected: transaction {code}: {reason}")]
    InvalidTransaction {
        index: u64,
        code: String,
        reason: ValidationError,
    },

    #[error("block {index} has {votes} of {needed} required votes")]
    NotEnoughVotes { index: u64, votes: usize, needed: usize },
}

pub struct ChainCore {
    params: Arc<ChainParams>,
    store: LedgerStore,
    mempool: Arc<Mempool>,
    staging: Arc<StagingArea>,
    /// Committed payloads served to syncing peers
    archive: RwLock<BTreeMap<u64, BlockPayload>>,
    /// Disk copy of the archive, when attached
    archive_disk: Option<Arc<PersistentStore>>,
    validator: Arc<TransactionValidator>,
    engine: Arc<StateTransitionEngine>,
    trust: Arc<TrustScoreManager>,
    proposer: BlockProposer,
    crypto: Arc<dyn CryptoProvider>,
    clock: Arc<dyn Clock>,
    keys: KeyPair,
}

impl ChainCore {
    pub fn new(
        params: Arc<ChainParams>,
        store: LedgerStore,
        contracts: Arc<ContractRegistry>,
        crypto: Arc<dyn CryptoProvider>,
        clock: Arc<dyn Clock>,
        keys: KeyPair,
    ) -> Self {
        let validator = Arc::new(TransactionValidator::new(params.clone(), crypto.clone(), contracts.clone()));
        let trust = Arc::new(TrustScoreManager::new(params.clone(), crypto.clone(), clock.clone()));
        let engine = Arc::new(StateTransitionEngine::new(params.clone(), contracts, trust.clone()));
        let proposer = BlockProposer::new(params.clone(), validator.clone(), engine.clone(), clock.clone());

        tracing::info!("Chain core ready for wallet {}", keys.address());

        Self {
            params,
            store,
            mempool: Arc::new(Mempool::new()),
            staging: Arc::new(StagingArea::new(crypto.clone())),
            archive: RwLock::new(BTreeMap::new()),
            archive_disk: None,
            validator,
            engine,
            trust,
            proposer,
            crypto,
            clock,
            keys,
        }
    }

    /// Keep the block archive on `disk` as well, loading what an earlier run
    /// left there
    pub fn with_archive(mut self, disk: Arc<PersistentStore>) -> anyhow::Result<Self> {
        let stored = disk.load_archive()?;
        tracing::info!("Loaded {} archived blocks from disk", stored.len());
        self.archive.write().extend(stored);
        self.archive_disk = Some(disk);
        Ok(self)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn mempool_sender(&self) -> MempoolSender {
        self.mempool.sender()
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn trust(&self) -> &TrustScoreManager {
        &self.trust
    }

    pub fn validator(&self) -> &TransactionValidator {
        &self.validator
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub fn wallet_address(&self) -> String {
        self.keys.address()
    }

    pub fn now(&self) -> i64 {
        self.clock.now_corrected_ms()
    }

    pub fn last_block(&self) -> Option<BlockRecord> {
        self.store.read().last_block().cloned()
    }

    /// Sign `tx` with this node's wallet
    pub fn sign_transaction(&self, tx: Transaction) -> SignedTransaction {
        SignedTransaction::new(tx).signed_by(&*self.crypto, &self.keys, &self.wallet_address())
    }

    /// Validate and pool a transaction
    pub fn submit_transaction(&self, tx: SignedTransaction) -> Result<(), ValidationError> {
        let ledger = self.store.read();
        self.mempool.admit(tx, &self.validator, &*ledger)
    }

    /// Admit whatever other tasks queued through [`Self::mempool_sender`]
    pub fn drain_submissions(&self) -> usize {
        let ledger = self.store.read();
        self.mempool.drain_channel(&self.validator, &*ledger)
    }

    /// Wallets whose receipts count for a slot with `roles`
    pub fn voters(&self, roles: &SlotRoles) -> Vec<String> {
        roles.voters(&self.params.sentinel_node_wallet)
    }

    /// Pool a receipt from a peer. The signing key must belong to a wallet on
    /// file and, when `voters` is given, to one of them.
    pub fn add_receipt(&self, receipt: Receipt, voters: Option<&[String]>) -> Result<bool, ChainError> {
        let voter = self
            .store
            .read()
            .wallet_by_public_key(&receipt.public_key)
            .map(|w| w.wallet_address.clone())
            .ok_or_else(|| StagingError::UnknownVoter(receipt.public_key.clone()))?;
        if let Some(voters) = voters {
            if !voters.contains(&voter) {
                return Err(StagingError::NotAVoter(voter).into());
            }
        }
        Ok(self.staging.add_receipt(receipt)?)
    }

    /// Agreeing votes from `voters` pooled for the staged proposal at `index`
    pub fn vote_count(&self, index: u64, hash: &str, voters: &[String]) -> usize {
        let ledger = self.store.read();
        self.staging.vote_count(index, hash, &*ledger, voters)
    }

    /// Propose the next block as this node. With `commit`, the block is also
    /// applied to the local ledger right away.
    pub fn mine(&self, roles: &SlotRoles, commit: bool) -> Result<Option<BlockPayload>, ChainError> {
        self.drain_submissions();
        let block = {
            let ledger = self.store.read();
            self.proposer
                .propose(&ledger, &self.mempool, &self.staging, &self.wallet_address(), roles)
        };
        let Some(block) = block else {
            return Ok(None);
        };

        let hash = block.compute_hash();
        let receipt = Receipt::new(&*self.crypto, &self.keys, Vote::Miner, block.index, &hash);
        let payload = BlockPayload::new(block, vec![receipt]);

        self.staging.stage_proposal(payload.clone())?;
        if commit {
            self.commit_block(&payload.data)?;
        }
        tracing::info!("Stored block proposal {} with hash {}", payload.index, payload.hash);
        Ok(Some(payload))
    }

    fn empty_block(&self, status: BlockStatus, roles: &SlotRoles, timestamp: i64) -> Result<(BlockPayload, Receipt), ChainError> {
        let block = self.proposer.propose_empty(&*self.store.read(), status, roles, timestamp);
        let hash = block.compute_hash();
        let receipt = Receipt::new(&*self.crypto, &self.keys, Vote::Valid, block.index, &hash);
        let payload = BlockPayload::new(block, vec![receipt.clone()]);
        self.staging.stage_proposal(payload.clone())?;
        Ok((payload, receipt))
    }

    /// Empty fallback block carrying this node's receipt for it
    pub fn mine_empty(&self, status: BlockStatus, roles: &SlotRoles) -> Result<BlockPayload, ChainError> {
        let (payload, _) = self.empty_block(status, roles, self.now())?;
        tracing::info!("Mined empty block {} ({:?})", payload.index, payload.data.status);
        Ok(payload)
    }

    /// Receipt for the empty block of a slot nobody filled. The block is
    /// stamped with the slot's no-block deadline so every committee member
    /// votes for the same hash.
    pub fn empty_block_receipt(&self, roles: &SlotRoles) -> Result<Receipt, ChainError> {
        let deadline = self
            .last_block()
            .map(|b| b.timestamp + self.params.block_interval_ms + self.params.no_block_timeout_ms)
            .unwrap_or_else(|| self.now());
        let (payload, receipt) = self.empty_block(BlockStatus::MiningTimeout, roles, deadline)?;
        tracing::info!("No block received, voting for empty block {}", payload.index);
        Ok(receipt)
    }

    /// Stage a received proposal and vote on it. The vote is pooled and
    /// returned for broadcast.
    pub fn accept_payload(&self, payload: BlockPayload) -> Result<Receipt, ChainError> {
        self.staging.stage_proposal(payload.clone())?;
        let vote = if self.check_block(&payload.data) {
            Vote::Valid
        } else {
            Vote::Invalid
        };
        tracing::info!("Voting {:?} on block {} ({})", vote, payload.index, payload.hash);

        let receipt = Receipt::new(&*self.crypto, &self.keys, vote, payload.index, &payload.hash);
        self.staging.add_receipt(receipt.clone())?;
        Ok(receipt)
    }

    /// Whether `block` would be accepted on top of the committed ledger
    pub fn check_block(&self, block: &Block) -> bool {
        match self.verify_block(block) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("block {} fails verification: {}", block.index, e);
                false
            }
        }
    }

    /// Replay `block` on a scratch copy of the committed ledger, validating
    /// every transaction against the state the ones before it left behind
    pub fn verify_block(&self, block: &Block) -> Result<(), ChainError> {
        let mut scratch = self.store.read().clone();

        let mut seen = HashSet::new();
        for signed in &block.body.transactions {
            let code = signed.code();
            if !seen.insert(code) || scratch.transaction_block(code).is_some() {
                return Err(ChainError::InvalidTransaction {
                    index: block.index,
                    code: code.to_string(),
                    reason: ValidationError::AlreadyOnChain(code.to_string()),
                });
            }
        }

        if self.engine.open_block(&mut scratch, block)?.is_none() {
            return Ok(());
        }
        let creator = block.creator_wallet.as_deref();
        for signed in &block.body.transactions {
            self.validator
                .validate(signed, &scratch)
                .into_result()
                .map_err(|reason| ChainError::InvalidTransaction {
                    index: block.index,
                    code: signed.code().to_string(),
                    reason,
                })?;
            self.engine
                .apply_transaction(&mut scratch, &signed.transaction, creator, block.index)?;
        }
        Ok(())
    }

    /// Apply `block` and publish the result. On error nothing is committed.
    pub fn commit_block(&self, block: &Block) -> Result<ApplyOutcome, ChainError> {
        let mut cursor = self.store.begin();
        let outcome = self.engine.apply_block(&mut cursor, block)?;
        cursor.commit();

        if let ApplyOutcome::Applied { index, .. } = &outcome {
            for code in block.transaction_codes() {
                self.mempool.remove(&code);
            }
            let payload = BlockPayload::new(block.clone(), self.staging.receipts_for(*index));
            if let Some(disk) = &self.archive_disk {
                if let Err(e) = disk.store_archived_block(&payload) {
                    tracing::warn!("Could not archive block {} on disk: {}", index, e);
                }
            }
            self.archive.write().insert(*index, payload);
            self.staging.prune_below(*index);
        }
        Ok(outcome)
    }

    fn check_hash(payload: &BlockPayload) -> Result<(), ChainError> {
        if payload.data.compute_hash() != payload.hash || payload.index != payload.data.index {
            return Err(StagingError::HashMismatch {
                index: payload.index,
                claimed: payload.hash.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Commit a staged or received payload after checking its hash
    pub fn commit_payload(&self, payload: &BlockPayload) -> Result<ApplyOutcome, ChainError> {
        Self::check_hash(payload)?;
        self.commit_block(&payload.data)
    }

    /// Commit a block received from a syncing peer. Its receipts must carry
    /// the minimum number of agreeing votes from `voters` and every
    /// transaction must validate in order.
    pub fn commit_synced(&self, payload: &BlockPayload, voters: &[String]) -> Result<ApplyOutcome, ChainError> {
        Self::check_hash(payload)?;

        let signed: Vec<&Receipt> = payload
            .receipts
            .iter()
            .filter(|r| r.verify(&*self.crypto))
            .collect();
        let votes = {
            let ledger = self.store.read();
            count_votes(signed.iter().copied(), payload.index, &payload.hash, &*ledger, voters)
        };
        let needed = self.params.minimum_acceptance_votes;
        if votes < needed {
            return Err(ChainError::NotEnoughVotes {
                index: payload.index,
                votes,
                needed,
            });
        }

        self.verify_block(&payload.data)?;
        for receipt in signed {
            if let Err(e) = self.staging.add_receipt(receipt.clone()) {
                tracing::debug!("skipping synced receipt for block {}: {}", payload.index, e);
            }
        }
        self.commit_block(&payload.data)
    }

    /// Up to `limit` committed payloads from `from_index` on
    pub fn archived_blocks(&self, from_index: u64, limit: usize) -> Vec<BlockPayload> {
        self.archive
            .read()
            .range(from_index..)
            .take(limit)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Forget archived payloads more than `keep` blocks behind the tip
    pub fn prune_archive(&self, keep: u64) -> usize {
        let floor = self.store.last_block_index().saturating_sub(keep);
        if let Some(disk) = &self.archive_disk {
            if let Err(e) = disk.prune_archive_below(floor) {
                tracing::warn!("Could not prune the archive on disk: {}", e);
            }
        }
        let mut archive = self.archive.write();
        let before = archive.len();
        *archive = archive.split_off(&floor);
        before - archive.len()
    }

    /// Drop stale pooled transactions
    pub fn cleanup_mempool(&self) -> usize {
        let ledger = self.store.read();
        self.mempool
            .cleanup(self.now(), self.params.mempool_max_age_ms, &*ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{one_way, token_record, Fixture};
    use pchain_types::constants::NETWORK_TOKEN_CODE;
    use pchain_types::{TransactionKind, Transfer};
    use tempfile::tempdir;

    fn gold(from: &str, to: &str, amount: i64) -> TransactionKind {
        TransactionKind::OneWayTransfer(Transfer {
            wallet1: from.to_string(),
            wallet2: to.to_string(),
            asset1_code: "GOLD".into(),
            asset2_code: String::new(),
            asset1_number: amount,
            asset2_number: 0,
        })
    }

    fn quorum_of_one(fx: &mut Fixture) {
        let mut params = (*fx.params).clone();
        params.minimum_acceptance_votes = 1;
        fx.set_params(params);
    }

    #[test]
    fn test_mine_and_commit() {
        let fx = Fixture::new();
        let core = fx.core(fx.custodian.keys.clone());
        core.submit_transaction(fx.sign(one_way(&fx.alice.address, &fx.bob.address, 10), &[&fx.alice]))
            .unwrap();

        let payload = core.mine(&SlotRoles::default(), true).unwrap().unwrap();
        assert_eq!(payload.index, 1);
        assert_eq!(payload.receipts[0].data.vote, Vote::Miner);
        assert_eq!(core.store().last_block_index(), 1);
        assert!(core.mempool().is_empty());
        assert!(core.staging().proposal(1).is_some());

        let ledger = core.store().read();
        assert_eq!(ledger.balance(&fx.bob.address, NETWORK_TOKEN_CODE), 1_010);
    }

    #[test]
    fn test_queued_submissions_are_mined() {
        let fx = Fixture::new();
        let core = fx.core(fx.custodian.keys.clone());
        core.mempool_sender()
            .send(fx.sign(one_way(&fx.alice.address, &fx.bob.address, 10), &[&fx.alice]))
            .unwrap();

        let payload = core.mine(&SlotRoles::default(), true).unwrap().unwrap();
        assert_eq!(payload.data.body.transactions.len(), 1);
    }

    #[test]
    fn test_committee_votes_on_received_payload() {
        let fx = Fixture::new();
        let miner = fx.core(fx.custodian.keys.clone());
        let voter = fx.core(fx.bob.keys.clone());
        let roles = SlotRoles {
            expected_miner: Some(fx.custodian.address.clone()),
            committee: vec![fx.bob.address.clone()],
        };

        miner
            .submit_transaction(fx.sign(one_way(&fx.alice.address, &fx.bob.address, 10), &[&fx.alice]))
            .unwrap();
        let payload = miner.mine(&roles, false).unwrap().unwrap();

        let receipt = voter.accept_payload(payload.clone()).unwrap();
        assert_eq!(receipt.data.vote, Vote::Valid);
        assert_eq!(voter.vote_count(1, &payload.hash, &voter.voters(&roles)), 2);

        let mut tampered = payload;
        tampered.data.body.transactions[0].transaction.fee = 0;
        tampered.hash = tampered.data.compute_hash();
        let receipt = voter.accept_payload(tampered).unwrap();
        assert_eq!(receipt.data.vote, Vote::Invalid);
    }

    #[test]
    fn test_voting_sees_earlier_transactions_of_the_block() {
        let fx = Fixture::new();
        {
            let mut cursor = fx.store.begin();
            cursor.insert_token(token_record("GOLD", &fx.custodian.address, 100));
            cursor.set_balance(&fx.alice.address, "GOLD", 100).unwrap();
            cursor.commit();
        }
        let miner = fx.core(fx.custodian.keys.clone());
        let voter = fx.core(fx.alice.keys.clone());

        // bob holds no gold until the first transfer lands
        miner
            .mempool()
            .insert(fx.sign_at(gold(&fx.alice.address, &fx.bob.address, 100), &[&fx.alice], 1));
        miner
            .mempool()
            .insert(fx.sign_at(gold(&fx.bob.address, &fx.alice.address, 50), &[&fx.bob], 2));
        let payload = miner.mine(&SlotRoles::default(), false).unwrap().unwrap();
        assert_eq!(payload.data.body.transactions.len(), 2);

        let receipt = voter.accept_payload(payload).unwrap();
        assert_eq!(receipt.data.vote, Vote::Valid);
    }

    #[test]
    fn test_receipts_from_outside_the_slot_are_refused() {
        let fx = Fixture::new();
        let core = fx.core(fx.custodian.keys.clone());
        let voters = vec![fx.bob.address.clone()];
        let stranger = KeyPair::generate();

        let from_bob = Receipt::new(&*fx.crypto, &fx.bob.keys, Vote::Valid, 1, "h1");
        let from_alice = Receipt::new(&*fx.crypto, &fx.alice.keys, Vote::Valid, 1, "h1");
        let from_stranger = Receipt::new(&*fx.crypto, &stranger, Vote::Valid, 1, "h1");

        assert_eq!(core.add_receipt(from_bob, Some(voters.as_slice())), Ok(true));
        assert_eq!(
            core.add_receipt(from_alice.clone(), Some(voters.as_slice())),
            Err(ChainError::Staging(StagingError::NotAVoter(fx.alice.address.clone())))
        );
        assert!(matches!(
            core.add_receipt(from_stranger, None),
            Err(ChainError::Staging(StagingError::UnknownVoter(_)))
        ));
        // known wallets may still be pooled outside a vote
        assert_eq!(core.add_receipt(from_alice, None), Ok(true));
        assert_eq!(core.vote_count(1, "h1", &voters), 1);
    }

    #[test]
    fn test_synced_block_needs_votes_and_valid_transactions() {
        let mut fx = Fixture::new();
        quorum_of_one(&mut fx);
        let follower = fx.core(fx.bob.keys.clone());
        let voters = vec![fx.custodian.address.clone()];
        let vote = |block: &Block| {
            Receipt::new(&*fx.crypto, &fx.custodian.keys, Vote::Miner, block.index, &block.compute_hash())
        };

        let unsigned = fx.next_block(vec![fx.sign(one_way(&fx.alice.address, &fx.bob.address, 900), &[])]);
        let forged = BlockPayload::new(unsigned.clone(), vec![vote(&unsigned)]);
        assert!(matches!(
            follower.commit_synced(&forged, &voters),
            Err(ChainError::InvalidTransaction {
                reason: ValidationError::MissingSignature(_),
                ..
            })
        ));

        let signed = fx.next_block(vec![fx.sign(one_way(&fx.alice.address, &fx.bob.address, 900), &[&fx.alice])]);
        let unvoted = BlockPayload::new(signed.clone(), vec![]);
        assert!(matches!(
            follower.commit_synced(&unvoted, &voters),
            Err(ChainError::NotEnoughVotes { votes: 0, needed: 1, .. })
        ));
        let outsider = BlockPayload::new(
            signed.clone(),
            vec![Receipt::new(&*fx.crypto, &fx.alice.keys, Vote::Valid, 1, &signed.compute_hash())],
        );
        assert!(follower.commit_synced(&outsider, &voters).is_err());
        assert_eq!(follower.store().last_block_index(), 0);

        let good = BlockPayload::new(signed.clone(), vec![vote(&signed)]);
        assert!(matches!(
            follower.commit_synced(&good, &voters),
            Ok(ApplyOutcome::Applied { index: 1, .. })
        ));
        assert_eq!(follower.store().read().balance(&fx.bob.address, NETWORK_TOKEN_CODE), 1_900);
        assert_eq!(follower.archived_blocks(1, 1)[0].receipts.len(), 1);
    }

    #[test]
    fn test_committed_blocks_are_archived() {
        let fx = Fixture::new();
        let core = fx.core(fx.custodian.keys.clone());
        for _ in 0..3 {
            core.mine(&SlotRoles::default(), true).unwrap().unwrap();
            fx.clock.advance(fx.params.block_interval_ms);
        }

        let served = core.archived_blocks(2, 10);
        assert_eq!(served.iter().map(|p| p.index).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(served[0].receipts.len(), 1);

        assert_eq!(core.prune_archive(1), 1);
        assert_eq!(core.archived_blocks(0, 10).len(), 2);
    }

    #[test]
    fn test_archive_survives_a_restart() {
        let fx = Fixture::new();
        let dir = tempdir().unwrap();
        let disk = Arc::new(PersistentStore::open(dir.path()).unwrap());
        let core = fx.core(fx.custodian.keys.clone()).with_archive(disk.clone()).unwrap();
        for _ in 0..3 {
            core.mine(&SlotRoles::default(), true).unwrap().unwrap();
            fx.clock.advance(fx.params.block_interval_ms);
        }
        core.prune_archive(2);
        let served = core.archived_blocks(1, 10);
        drop(core);

        let restarted = fx.core(fx.custodian.keys.clone()).with_archive(disk).unwrap();
        assert_eq!(restarted.archived_blocks(1, 10), served);
        assert_eq!(served.iter().map(|p| p.index).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_block_votes_converge() {
        let fx = Fixture::new();
        let first = fx.core(fx.alice.keys.clone());
        let second = fx.core(fx.bob.keys.clone());
        let payload = first.mine(&SlotRoles::default(), true).unwrap().unwrap();
        second.commit_payload(&payload).unwrap();

        let roles = SlotRoles::default();
        let a = first.empty_block_receipt(&roles).unwrap();
        fx.clock.advance(1_234);
        let b = second.empty_block_receipt(&roles).unwrap();
        assert_eq!(a.data.block_index, 2);
        assert_eq!(a.data.block_hash, b.data.block_hash);
    }

    #[test]
    fn test_commit_payload_rejects_bad_hash() {
        let fx = Fixture::new();
        let core = fx.core(fx.custodian.keys.clone());
        let mut payload = core
            .mine_empty(BlockStatus::MiningTimeout, &SlotRoles::default())
            .unwrap();
        payload.hash = "forged".into();
        assert!(matches!(
            core.commit_payload(&payload),
            Err(ChainError::Staging(StagingError::HashMismatch { .. }))
        ));
        assert_eq!(core.store().last_block_index(), 0);
    }
}
