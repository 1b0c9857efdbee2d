//! Trust scores
//!
//! Scores are directed person-to-person rows. The network's view of a node is
//! the score the network trust manager holds for the node's person id; that
//! is the row block creation and receipt voting move. Missing rows read as
//! the initial score.

use std::sync::Arc;

use pchain_types::{ChainParams, Clock, CryptoProvider, Receipt, TrustScore, Vote};

use crate::ledger_store::{LedgerRead, LedgerState};

/// Something a node did that moves its network trust score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustEvent {
    ValidBlockCreation,
    InvalidBlockCreation,
    ValidReceipt,
    InvalidReceipt,
}

/// Score adjustment functions. Valid events must not lower a score and
/// invalid events must not raise it.
pub trait ScoringPolicy: Send + Sync {
    fn valid_block_creation(&self, current: i64) -> i64;
    fn invalid_block_creation(&self, current: i64) -> i64;
    fn valid_receipt(&self, current: i64) -> i64;
    fn invalid_receipt(&self, current: i64) -> i64;

    fn apply(&self, event: TrustEvent, current: i64) -> i64 {
        match event {
            TrustEvent::ValidBlockCreation => self.valid_block_creation(current),
            TrustEvent::InvalidBlockCreation => self.invalid_block_creation(current),
            TrustEvent::ValidReceipt => self.valid_receipt(current),
            TrustEvent::InvalidReceipt => self.invalid_receipt(current),
        }
    }
}

/// Rewards close a fraction of the gap to the ceiling, penalties take a
/// fixed slice of the ceiling. Blocks weigh ten times more than receipts.
#[derive(Debug, Clone, Copy)]
pub struct DefaultScoringPolicy {
    pub max_score: i64,
}

impl DefaultScoringPolicy {
    pub fn new(max_score: i64) -> Self {
        Self { max_score }
    }
}

impl ScoringPolicy for DefaultScoringPolicy {
    fn valid_block_creation(&self, current: i64) -> i64 {
        current + (self.max_score - current).max(0) / 10
    }

    fn invalid_block_creation(&self, current: i64) -> i64 {
        current - self.max_score / 10
    }

    fn valid_receipt(&self, current: i64) -> i64 {
        current + (self.max_score - current).max(0) / 100
    }

    fn invalid_receipt(&self, current: i64) -> i64 {
        current - self.max_score / 100
    }
}

pub struct TrustScoreManager {
    params: Arc<ChainParams>,
    policy: Arc<dyn ScoringPolicy>,
    crypto: Arc<dyn CryptoProvider>,
    clock: Arc<dyn Clock>,
}

impl TrustScoreManager {
    pub fn new(params: Arc<ChainParams>, crypto: Arc<dyn CryptoProvider>, clock: Arc<dyn Clock>) -> Self {
        let policy = Arc::new(DefaultScoringPolicy::new(params.max_trust_score));
        Self {
            params,
            policy,
            crypto,
            clock,
        }
    }

    /// Swap in a different scoring policy
    pub fn with_policy(mut self, policy: Arc<dyn ScoringPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn clamp(&self, score: i64) -> i64 {
        score.clamp(-self.params.max_trust_score, self.params.max_trust_score)
    }

    /// Score `src` holds for `dest`, initial score when no row exists
    pub fn score_between(&self, ledger: &dyn LedgerRead, src_person_id: &str, dest_person_id: &str) -> i64 {
        ledger
            .trust_score(src_person_id, dest_person_id)
            .map(|s| s.score)
            .unwrap_or(self.params.initial_trust_score)
    }

    /// The network trust manager's score for the person behind `wallet`
    pub fn network_score(&self, ledger: &dyn LedgerRead, wallet: &str) -> i64 {
        match ledger.person_id(wallet) {
            Some(pid) => self.score_between(ledger, &self.params.network_trust_manager_pid, pid),
            None => self.params.initial_trust_score,
        }
    }

    pub fn scores_for_wallets(&self, ledger: &dyn LedgerRead, wallets: &[String]) -> Vec<(String, i64)> {
        wallets
            .iter()
            .map(|w| (w.clone(), self.network_score(ledger, w)))
            .collect()
    }

    /// Scores others hold for the person behind `wallet`
    pub fn incoming_scores(&self, ledger: &dyn LedgerRead, wallet: &str) -> Vec<TrustScore> {
        ledger
            .person_id(wallet)
            .map(|pid| ledger.trust_scores_to(pid).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Scores the person behind `wallet` holds for others
    pub fn outgoing_scores(&self, ledger: &dyn LedgerRead, wallet: &str) -> Vec<TrustScore> {
        ledger
            .person_id(wallet)
            .map(|pid| ledger.trust_scores_from(pid).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Move the network score of `person_id` by `event`, returning the new
    /// clamped score
    pub fn adjust(&self, ledger: &mut LedgerState, person_id: &str, event: TrustEvent) -> i64 {
        let manager = self.params.network_trust_manager_pid.clone();
        let current = self.score_between(&*ledger, &manager, person_id);
        let score = self.clamp(self.policy.apply(event, current));
        ledger.upsert_trust_score(TrustScore {
            src_person_id: manager,
            dest_person_id: person_id.to_string(),
            score,
            last_time: self.clock.now_corrected_ms(),
        });
        score
    }

    /// Score the voters of `receipts` against the committed chain. Returns how
    /// many receipts moved a score.
    pub fn update_from_receipts(&self, ledger: &mut LedgerState, receipts: &[Receipt]) -> usize {
        let mut applied = 0;
        for receipt in receipts {
            let digest = receipt.digest();
            if ledger.receipt_included(&digest) {
                continue;
            }
            let Some(event) = self.classify(ledger, receipt) else {
                continue;
            };
            let Some(person_id) = ledger
                .wallet_by_public_key(&receipt.public_key)
                .and_then(|w| ledger.person_id(&w.wallet_address))
                .map(str::to_string)
            else {
                continue;
            };

            let score = self.adjust(ledger, &person_id, event);
            ledger.mark_receipt_included(&digest);
            tracing::debug!(
                "receipt for block {} from {}: {:?}, score now {}",
                receipt.data.block_index,
                person_id,
                event,
                score
            );
            applied += 1;
        }
        applied
    }

    fn classify(&self, ledger: &LedgerState, receipt: &Receipt) -> Option<TrustEvent> {
        if !receipt.verify(&*self.crypto) {
            tracing::warn!("ignoring receipt with bad signature for block {}", receipt.data.block_index);
            return None;
        }
        let actual = ledger.block(receipt.data.block_index)?;
        let matches = actual.hash == receipt.data.block_hash;

        match receipt.data.vote {
            Vote::Miner if matches => Some(TrustEvent::ValidBlockCreation),
            Vote::Miner => Some(TrustEvent::InvalidBlockCreation),
            // empty fallback blocks carry no committee signal
            _ if actual.proof == pchain_types::constants::EMPTY_BLOCK_PROOF => None,
            Vote::Valid if matches => Some(TrustEvent::ValidReceipt),
            Vote::Invalid if !matches => Some(TrustEvent::ValidReceipt),
            _ => Some(TrustEvent::InvalidReceipt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::Fixture;
    use pchain_types::{BlockRecord, BlockStatus, Receipt, Vote};

    fn block(index: u64, hash: &str, proof: u64) -> BlockRecord {
        BlockRecord {
            block_index: index,
            hash: hash.to_string(),
            timestamp: 0,
            status: BlockStatus::Normal,
            proof,
            previous_hash: String::new(),
            creator_wallet: None,
            expected_miner: None,
            committee: vec![],
            transaction_codes: vec![],
        }
    }

    #[test]
    fn test_default_policy_is_monotone() {
        let policy = DefaultScoringPolicy::new(1_000_000);
        for current in [-1_000_000, 0, 100_000, 999_999, 1_000_000] {
            assert!(policy.valid_block_creation(current) >= current);
            assert!(policy.valid_receipt(current) >= current);
            assert!(policy.invalid_block_creation(current) <= current);
            assert!(policy.invalid_receipt(current) <= current);
        }
        assert_eq!(policy.valid_block_creation(100_000), 190_000);
        assert_eq!(policy.invalid_receipt(100_000), 90_000);
    }

    #[test]
    fn test_missing_rows_read_as_initial_score() {
        let fx = Fixture::new();
        let trust = fx.trust();
        let ledger = fx.store.read();
        assert_eq!(trust.network_score(&*ledger, &fx.alice.address), 100_000);
        assert_eq!(trust.score_between(&*ledger, "pi-a", "pi-b"), 100_000);
        assert_eq!(trust.network_score(&*ledger, "0xunknown"), 100_000);
    }

    #[test]
    fn test_adjust_clamps_to_ceiling_and_floor() {
        struct Wild;
        impl ScoringPolicy for Wild {
            fn valid_block_creation(&self, c: i64) -> i64 {
                c + 5_000_000
            }
            fn invalid_block_creation(&self, c: i64) -> i64 {
                c - 5_000_000
            }
            fn valid_receipt(&self, c: i64) -> i64 {
                c
            }
            fn invalid_receipt(&self, c: i64) -> i64 {
                c
            }
        }

        let fx = Fixture::new();
        let trust = fx.trust().with_policy(Arc::new(Wild));
        let mut state = fx.store.read().clone();
        assert_eq!(trust.adjust(&mut state, "pi-a", TrustEvent::ValidBlockCreation), 1_000_000);
        assert_eq!(trust.adjust(&mut state, "pi-a", TrustEvent::InvalidBlockCreation), -1_000_000);
        assert_eq!(trust.adjust(&mut state, "pi-a", TrustEvent::InvalidBlockCreation), -1_000_000);
    }

    #[test]
    fn test_receipt_votes_score_voters() {
        let fx = Fixture::new();
        let trust = fx.trust();
        let mut state = fx.store.read().clone();
        state.record_block(block(1, "h1", 0));

        let miner = Receipt::new(&*fx.crypto, &fx.alice.keys, Vote::Miner, 1, "h1");
        let agree = Receipt::new(&*fx.crypto, &fx.bob.keys, Vote::Valid, 1, "h1");
        let wrong = Receipt::new(&*fx.crypto, &fx.custodian.keys, Vote::Valid, 1, "forged");

        assert_eq!(trust.update_from_receipts(&mut state, &[miner, agree, wrong.clone()]), 3);
        assert_eq!(trust.network_score(&state, &fx.alice.address), 190_000);
        assert_eq!(trust.network_score(&state, &fx.bob.address), 109_000);
        assert_eq!(trust.network_score(&state, &fx.custodian.address), 90_000);

        // the same receipt is not counted twice
        assert_eq!(trust.update_from_receipts(&mut state, &[wrong]), 0);
        assert_eq!(trust.network_score(&state, &fx.custodian.address), 90_000);
    }

    #[test]
    fn test_disagreeing_with_a_bad_hash_is_rewarded() {
        let fx = Fixture::new();
        let trust = fx.trust();
        let mut state = fx.store.read().clone();
        state.record_block(block(1, "h1", 0));

        let dissent = Receipt::new(&*fx.crypto, &fx.bob.keys, Vote::Invalid, 1, "forged");
        trust.update_from_receipts(&mut state, &[dissent]);
        assert_eq!(trust.network_score(&state, &fx.bob.address), 109_000);
    }

    #[test]
    fn test_empty_block_receipts_are_skipped() {
        let fx = Fixture::new();
        let trust = fx.trust();
        let mut state = fx.store.read().clone();
        state.record_block(block(1, "h1", 42));

        let vote = Receipt::new(&*fx.crypto, &fx.bob.keys, Vote::Valid, 1, "h1");
        assert_eq!(trust.update_from_receipts(&mut state, &[vote]), 0);
        assert!(trust.incoming_scores(&state, &fx.bob.address).is_empty());
    }

    #[test]
    fn test_receipts_for_unknown_blocks_or_voters_are_skipped() {
        let fx = Fixture::new();
        let trust = fx.trust();
        let mut state = fx.store.read().clone();
        state.record_block(block(1, "h1", 0));

        let outsider = Receipt::new(&*fx.crypto, &pchain_types::KeyPair::generate(), Vote::Valid, 1, "h1");
        let future = Receipt::new(&*fx.crypto, &fx.bob.keys, Vote::Valid, 9, "h9");
        let mut tampered = Receipt::new(&*fx.crypto, &fx.bob.keys, Vote::Valid, 1, "h1");
        tampered.data.vote = Vote::Miner;

        assert_eq!(trust.update_from_receipts(&mut state, &[outsider, future, tampered]), 0);
    }
}
