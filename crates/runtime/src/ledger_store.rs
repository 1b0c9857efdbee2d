//! Ledger Store
//!
//! Every table the node owns lives in one [`LedgerState`]. Reads go through
//! [`LedgerRead`]; writes happen on a [`LedgerCursor`], a private working copy
//! taken under the writer lock and published atomically by `commit`. Dropping
//! a cursor without committing discards everything written through it.

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use pchain_types::constants::{CONTRACT_PREFIX, ZERO_ADDRESS};
use pchain_types::{
    BlockRecord, ContractRecord, LedgerError, MinerRecord, Person, StakeEntry, TokenRecord,
    TrustScore, WalletRecord,
};

/// Read access to the ledger tables
pub trait LedgerRead {
    fn wallet(&self, address: &str) -> Option<&WalletRecord>;

    /// Wallet whose on-file public key is `public_key` (hex)
    fn wallet_by_public_key(&self, public_key: &str) -> Option<&WalletRecord>;

    fn person_id(&self, wallet: &str) -> Option<&str>;

    fn wallets_of_person(&self, person_id: &str) -> Vec<&str>;

    fn is_dao_member(&self, dao_person_id: &str, member_person_id: &str) -> bool;

    fn token(&self, code: &str) -> Option<&TokenRecord>;

    /// Balance of `wallet` in `token`, zero when no row exists
    fn balance(&self, wallet: &str, token: &str) -> i64;

    /// Block index a transaction code was committed in
    fn transaction_block(&self, code: &str) -> Option<u64>;

    fn block(&self, index: u64) -> Option<&BlockRecord>;

    fn last_block(&self) -> Option<&BlockRecord>;

    fn trust_score(&self, src_person_id: &str, dest_person_id: &str) -> Option<&TrustScore>;

    fn trust_scores_from(&self, src_person_id: &str) -> Vec<&TrustScore>;

    fn trust_scores_to(&self, dest_person_id: &str) -> Vec<&TrustScore>;

    fn miner(&self, wallet: &str) -> Option<&MinerRecord>;

    fn miners(&self) -> Vec<&MinerRecord>;

    fn stake(&self, wallet: &str) -> Option<&StakeEntry>;

    fn contract(&self, address: &str) -> Option<&ContractRecord>;

    fn receipt_included(&self, digest: &str) -> bool;

    fn is_smart_contract(&self, address: &str) -> bool {
        address.starts_with(CONTRACT_PREFIX) && self.contract(address).is_some()
    }

    /// Whether `address` names a wallet. With `check_sc`, deployed contract
    /// addresses count as wallets too.
    fn is_wallet_valid(&self, address: &str, check_sc: bool) -> bool {
        (check_sc && self.is_smart_contract(address)) || self.wallet(address).is_some()
    }

    /// Index of the last committed block, 0 for an empty chain
    fn last_block_index(&self) -> u64 {
        self.last_block().map(|b| b.block_index).unwrap_or(0)
    }
}

/// All ledger tables
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LedgerState {
    pub(crate) wallets: BTreeMap<String, WalletRecord>,
    pub(crate) persons: BTreeMap<String, Person>,
    /// wallet address -> person id
    pub(crate) person_wallet: BTreeMap<String, String>,
    /// (dao person id, member person id)
    pub(crate) dao_membership: BTreeSet<(String, String)>,
    pub(crate) tokens: BTreeMap<String, TokenRecord>,
    /// (wallet, tokencode) -> amount
    pub(crate) balances: BTreeMap<(String, String), i64>,
    /// transaction code -> block index
    pub(crate) transactions: BTreeMap<String, u64>,
    pub(crate) blocks: BTreeMap<u64, BlockRecord>,
    /// (src person, dest person) -> score
    pub(crate) trust_scores: BTreeMap<(String, String), TrustScore>,
    pub(crate) miners: BTreeMap<String, MinerRecord>,
    pub(crate) stakes: BTreeMap<String, StakeEntry>,
    pub(crate) contracts: BTreeMap<String, ContractRecord>,
    /// Digests of receipts already included in a committed block
    pub(crate) receipts: BTreeSet<String>,
    /// Prior values of rows written since the last checkpoint
    pub(crate) undo: Option<Vec<Undo>>,
}

/// One reversible write. `None` means the row did not exist.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Undo {
    Wallet(String, Option<WalletRecord>),
    Person(String, Option<Person>),
    PersonWallet(String, Option<String>),
    DaoMember((String, String)),
    Token(String, Option<TokenRecord>),
    Balance((String, String), Option<i64>),
    Transaction(String),
    Block(u64, Option<BlockRecord>),
    TrustScore((String, String), Option<TrustScore>),
    Miner(String, Option<MinerRecord>),
    Stake(String, Option<StakeEntry>),
    Contract(String),
    Receipt(String),
}

fn restore<K: Ord, V>(table: &mut BTreeMap<K, V>, key: K, prior: Option<V>) {
    match prior {
        Some(value) => {
            table.insert(key, value);
        }
        None => {
            table.remove(&key);
        }
    }
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-or-ignore on wallet address
    pub fn insert_wallet(&mut self, wallet: WalletRecord) -> bool {
        if self.wallets.contains_key(&wallet.wallet_address) {
            return false;
        }
        self.journal(|| Undo::Wallet(wallet.wallet_address.clone(), None));
        self.wallets.insert(wallet.wallet_address.clone(), wallet);
        true
    }

    pub fn insert_person(&mut self, person: Person) -> bool {
        if self.persons.contains_key(&person.person_id) {
            return false;
        }
        self.journal(|| Undo::Person(person.person_id.clone(), None));
        self.persons.insert(person.person_id.clone(), person);
        true
    }

    /// Map `wallet` to `person_id` unless it already belongs to someone
    pub fn link_wallet(&mut self, person_id: &str, wallet: &str) -> bool {
        if self.person_wallet.contains_key(wallet) {
            return false;
        }
        self.journal(|| Undo::PersonWallet(wallet.to_string(), None));
        self.person_wallet
            .insert(wallet.to_string(), person_id.to_string());
        true
    }

    pub fn add_dao_member(&mut self, dao_person_id: &str, member_person_id: &str) {
        let key = (dao_person_id.to_string(), member_person_id.to_string());
        if !self.dao_membership.contains(&key) {
            self.journal(|| Undo::DaoMember(key.clone()));
            self.dao_membership.insert(key);
        }
    }

    /// Insert-or-ignore on tokencode
    pub fn insert_token(&mut self, token: TokenRecord) -> bool {
        if self.tokens.contains_key(&token.tokencode) {
            return false;
        }
        self.journal(|| Undo::Token(token.tokencode.clone(), None));
        self.tokens.insert(token.tokencode.clone(), token);
        true
    }

    /// Grow a token's cumulative minted amount
    pub fn add_token_amount(&mut self, code: &str, amount: i64) -> Result<(), LedgerError> {
        let token = self
            .tokens
            .get(code)
            .ok_or_else(|| LedgerError::UnknownToken(code.to_string()))?;
        let total = token
            .amount_created
            .checked_add(amount)
            .ok_or_else(|| LedgerError::AmountOverflow {
                wallet: token.custodian.clone(),
                token: code.to_string(),
            })?;
        let mut updated = token.clone();
        updated.amount_created = total;
        let previous = self.tokens.insert(code.to_string(), updated);
        self.journal(|| Undo::Token(code.to_string(), previous));
        Ok(())
    }

    pub fn set_balance(&mut self, wallet: &str, token: &str, amount: i64) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::NegativeBalance {
                wallet: wallet.to_string(),
                token: token.to_string(),
            });
        }
        let key = (wallet.to_string(), token.to_string());
        let previous = self.balances.insert(key.clone(), amount);
        self.journal(|| Undo::Balance(key, previous));
        Ok(())
    }

    pub fn credit(&mut self, wallet: &str, token: &str, amount: i64) -> Result<(), LedgerError> {
        let updated = self
            .balance(wallet, token)
            .checked_add(amount)
            .ok_or_else(|| LedgerError::AmountOverflow {
                wallet: wallet.to_string(),
                token: token.to_string(),
            })?;
        self.set_balance(wallet, token, updated)
    }

    /// Move `amount` of `token` between wallets.
    ///
    /// Same-wallet moves and the zero address as sender are skipped; the zero
    /// address as receiver burns.
    pub fn transfer(&mut self, sender: &str, receiver: &str, token: &str, amount: i64) -> Result<(), LedgerError> {
        if sender == receiver {
            tracing::debug!("skipping transfer of {} {} to self ({})", amount, token, sender);
            return Ok(());
        }
        if sender == ZERO_ADDRESS {
            tracing::debug!("skipping transfer from the zero address");
            return Ok(());
        }

        let negative = || LedgerError::NegativeBalance {
            wallet: sender.to_string(),
            token: token.to_string(),
        };
        if amount < 0 {
            return Err(negative());
        }
        let sender_balance = self
            .balance(sender, token)
            .checked_sub(amount)
            .ok_or_else(negative)?;
        if receiver == ZERO_ADDRESS {
            return self.set_balance(sender, token, sender_balance);
        }
        let receiver_balance = self
            .balance(receiver, token)
            .checked_add(amount)
            .ok_or_else(|| LedgerError::AmountOverflow {
                wallet: receiver.to_string(),
                token: token.to_string(),
            })?;
        self.set_balance(sender, token, sender_balance)?;
        self.set_balance(receiver, token, receiver_balance)
    }

    pub fn record_transaction(&mut self, code: &str, block_index: u64) {
        if !self.transactions.contains_key(code) {
            self.journal(|| Undo::Transaction(code.to_string()));
            self.transactions.insert(code.to_string(), block_index);
        }
    }

    pub fn record_block(&mut self, block: BlockRecord) {
        let index = block.block_index;
        let previous = self.blocks.insert(index, block);
        self.journal(|| Undo::Block(index, previous));
    }

    pub fn upsert_trust_score(&mut self, score: TrustScore) {
        let key = (score.src_person_id.clone(), score.dest_person_id.clone());
        let previous = self.trust_scores.insert(key.clone(), score);
        self.journal(|| Undo::TrustScore(key, previous));
    }

    pub fn insert_trust_score_if_absent(&mut self, score: TrustScore) -> bool {
        let key = (score.src_person_id.clone(), score.dest_person_id.clone());
        if self.trust_scores.contains_key(&key) {
            return false;
        }
        self.upsert_trust_score(score);
        true
    }

    /// Upsert guarded by freshness: only a strictly newer broadcast replaces
    /// the stored row.
    pub fn upsert_miner(&mut self, miner: MinerRecord) -> bool {
        if let Some(existing) = self.miners.get(&miner.wallet_address) {
            if existing.last_broadcast_timestamp >= miner.last_broadcast_timestamp {
                return false;
            }
        }
        let wallet = miner.wallet_address.clone();
        let previous = self.miners.insert(wallet.clone(), miner);
        self.journal(|| Undo::Miner(wallet, previous));
        true
    }

    pub fn put_stake(&mut self, entry: StakeEntry) {
        let wallet = entry.wallet_address.clone();
        let previous = self.stakes.insert(wallet.clone(), entry);
        self.journal(|| Undo::Stake(wallet, previous));
    }

    pub fn insert_contract(&mut self, contract: ContractRecord) -> bool {
        if self.contracts.contains_key(&contract.address) {
            return false;
        }
        self.journal(|| Undo::Contract(contract.address.clone()));
        self.contracts.insert(contract.address.clone(), contract);
        true
    }

    pub fn mark_receipt_included(&mut self, digest: &str) {
        if self.receipts.insert(digest.to_string()) {
            self.journal(|| Undo::Receipt(digest.to_string()));
        }
    }

    /// Start recording the prior value of every row written from here on,
    /// so [`rollback`](Self::rollback) can revert them
    pub fn checkpoint(&mut self) {
        self.undo = Some(Vec::new());
    }

    /// Keep the writes made since [`checkpoint`](Self::checkpoint)
    pub fn release(&mut self) {
        self.undo = None;
    }

    /// Revert every write made since [`checkpoint`](Self::checkpoint)
    pub fn rollback(&mut self) {
        let Some(entries) = self.undo.take() else {
            return;
        };
        let reverted = entries.len();
        for entry in entries.into_iter().rev() {
            match entry {
                Undo::Wallet(key, prior) => restore(&mut self.wallets, key, prior),
                Undo::Person(key, prior) => restore(&mut self.persons, key, prior),
                Undo::PersonWallet(key, prior) => restore(&mut self.person_wallet, key, prior),
                Undo::DaoMember(key) => {
                    self.dao_membership.remove(&key);
                }
                Undo::Token(key, prior) => restore(&mut self.tokens, key, prior),
                Undo::Balance(key, prior) => restore(&mut self.balances, key, prior),
                Undo::Transaction(key) => {
                    self.transactions.remove(&key);
                }
                Undo::Block(key, prior) => restore(&mut self.blocks, key, prior),
                Undo::TrustScore(key, prior) => restore(&mut self.trust_scores, key, prior),
                Undo::Miner(key, prior) => restore(&mut self.miners, key, prior),
                Undo::Stake(key, prior) => restore(&mut self.stakes, key, prior),
                Undo::Contract(key) => {
                    self.contracts.remove(&key);
                }
                Undo::Receipt(key) => {
                    self.receipts.remove(&key);
                }
            }
        }
        tracing::debug!("rolled back {} ledger writes", reverted);
    }

    fn journal(&mut self, entry: impl FnOnce() -> Undo) {
        if let Some(undo) = self.undo.as_mut() {
            undo.push(entry());
        }
    }

    /// Row counts per table, for logs
    pub fn table_sizes(&self) -> Vec<(&'static str, usize)> {
        vec![
            ("wallets", self.wallets.len()),
            ("persons", self.persons.len()),
            ("tokens", self.tokens.len()),
            ("balances", self.balances.len()),
            ("transactions", self.transactions.len()),
            ("blocks", self.blocks.len()),
            ("trust_scores", self.trust_scores.len()),
            ("miners", self.miners.len()),
            ("stakes", self.stakes.len()),
            ("contracts", self.contracts.len()),
            ("receipts", self.receipts.len()),
        ]
    }
}

impl LedgerRead for LedgerState {
    fn wallet(&self, address: &str) -> Option<&WalletRecord> {
        self.wallets.get(address)
    }

    fn wallet_by_public_key(&self, public_key: &str) -> Option<&WalletRecord> {
        self.wallets.values().find(|w| w.wallet_public == public_key)
    }

    fn person_id(&self, wallet: &str) -> Option<&str> {
        self.person_wallet.get(wallet).map(String::as_str)
    }

    fn wallets_of_person(&self, person_id: &str) -> Vec<&str> {
        self.person_wallet
            .iter()
            .filter(|(_, pid)| pid.as_str() == person_id)
            .map(|(wallet, _)| wallet.as_str())
            .collect()
    }

    fn is_dao_member(&self, dao_person_id: &str, member_person_id: &str) -> bool {
        self.dao_membership
            .contains(&(dao_person_id.to_string(), member_person_id.to_string()))
    }

    fn token(&self, code: &str) -> Option<&TokenRecord> {
        self.tokens.get(code)
    }

    fn balance(&self, wallet: &str, token: &str) -> i64 {
        self.balances
            .get(&(wallet.to_string(), token.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn transaction_block(&self, code: &str) -> Option<u64> {
        self.transactions.get(code).copied()
    }

    fn block(&self, index: u64) -> Option<&BlockRecord> {
        self.blocks.get(&index)
    }

    fn last_block(&self) -> Option<&BlockRecord> {
        self.blocks.values().next_back()
    }

    fn trust_score(&self, src_person_id: &str, dest_person_id: &str) -> Option<&TrustScore> {
        self.trust_scores
            .get(&(src_person_id.to_string(), dest_person_id.to_string()))
    }

    fn trust_scores_from(&self, src_person_id: &str) -> Vec<&TrustScore> {
        self.trust_scores
            .values()
            .filter(|s| s.src_person_id == src_person_id)
            .collect()
    }

    fn trust_scores_to(&self, dest_person_id: &str) -> Vec<&TrustScore> {
        self.trust_scores
            .values()
            .filter(|s| s.dest_person_id == dest_person_id)
            .collect()
    }

    fn miner(&self, wallet: &str) -> Option<&MinerRecord> {
        self.miners.get(wallet)
    }

    fn miners(&self) -> Vec<&MinerRecord> {
        self.miners.values().collect()
    }

    fn stake(&self, wallet: &str) -> Option<&StakeEntry> {
        self.stakes.get(wallet)
    }

    fn contract(&self, address: &str) -> Option<&ContractRecord> {
        self.contracts.get(address)
    }

    fn receipt_included(&self, digest: &str) -> bool {
        self.receipts.contains(digest)
    }
}

/// Thread-safe ledger with a single writer
#[derive(Clone, Default)]
pub struct LedgerStore {
    /// Committed state
    state: Arc<RwLock<LedgerState>>,
    /// Held for the lifetime of a cursor
    writer: Arc<Mutex<()>>,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: LedgerState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Read the committed state
    pub fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read()
    }

    /// Open a write cursor. Blocks while another cursor is live.
    pub fn begin(&self) -> LedgerCursor<'_> {
        let writer = self.writer.lock();
        let working = self.state.read().clone();
        LedgerCursor {
            store: self,
            _writer: writer,
            working,
        }
    }

    /// Replace the committed state wholesale (snapshot restore)
    pub fn restore(&self, state: LedgerState) {
        let _writer = self.writer.lock();
        *self.state.write() = state;
    }

    pub fn last_block_index(&self) -> u64 {
        self.read().last_block_index()
    }
}

/// Transaction-scoped write access to the ledger
pub struct LedgerCursor<'a> {
    store: &'a LedgerStore,
    _writer: MutexGuard<'a, ()>,
    working: LedgerState,
}

impl<'a> LedgerCursor<'a> {
    /// Publish the working copy
    pub fn commit(self) {
        let LedgerCursor {
            store,
            _writer,
            working,
        } = self;
        *store.state.write() = working;
    }

    pub fn state(&self) -> &LedgerState {
        &self.working
    }
}

impl Deref for LedgerCursor<'_> {
    type Target = LedgerState;

    fn deref(&self) -> &Self::Target {
        &self.working
    }
}

impl DerefMut for LedgerCursor<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.working
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn wallet(address: &str) -> WalletRecord {
        WalletRecord {
            wallet_address: address.to_string(),
            wallet_public: format!("pk-{}", address),
            custodian_wallet: "0xcustodian".to_string(),
            kyc_docs: vec![],
            owner_type: 1,
            jurisdiction: 1,
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_transfer_moves_and_burns() {
        let mut state = LedgerState::new();
        state.set_balance("0xaa", "TK", 100).unwrap();

        state.transfer("0xaa", "0xbb", "TK", 30).unwrap();
        assert_eq!(state.balance("0xaa", "TK"), 70);
        assert_eq!(state.balance("0xbb", "TK"), 30);

        state.transfer("0xaa", ZERO_ADDRESS, "TK", 20).unwrap();
        assert_eq!(state.balance("0xaa", "TK"), 50);
        assert_eq!(state.balance(ZERO_ADDRESS, "TK"), 0);
    }

    #[test]
    fn test_transfer_never_goes_negative() {
        let mut state = LedgerState::new();
        state.set_balance("0xaa", "TK", 10).unwrap();
        let err = state.transfer("0xaa", "0xbb", "TK", 11).unwrap_err();
        assert!(matches!(err, LedgerError::NegativeBalance { .. }));
    }

    #[test]
    fn test_overflowing_credit_leaves_balances_untouched() {
        let mut state = LedgerState::new();
        state.set_balance("0xaa", "TK", 10).unwrap();
        state.set_balance("0xbb", "TK", i64::MAX).unwrap();

        let err = state.transfer("0xaa", "0xbb", "TK", 1).unwrap_err();
        assert!(matches!(err, LedgerError::AmountOverflow { .. }));
        assert_eq!(state.balance("0xaa", "TK"), 10);
        assert_eq!(state.balance("0xbb", "TK"), i64::MAX);

        assert!(state.credit("0xbb", "TK", 1).is_err());
        assert!(state.transfer("0xaa", "0xcc", "TK", i64::MIN).is_err());
    }

    #[test]
    fn test_rollback_reverts_only_writes_since_checkpoint() {
        let mut state = LedgerState::new();
        state.set_balance("0xaa", "TK", 100).unwrap();
        state.insert_wallet(wallet("0xaa"));

        state.checkpoint();
        state.transfer("0xaa", "0xbb", "TK", 40).unwrap();
        state.insert_wallet(wallet("0xbb"));
        state.insert_wallet(wallet("0xaa"));
        state.add_dao_member("pi01", "pi02");
        state.mark_receipt_included("digest");
        state.rollback();

        assert_eq!(state.balance("0xaa", "TK"), 100);
        assert!(!state.balances.contains_key(&("0xbb".to_string(), "TK".to_string())));
        assert!(state.wallet("0xbb").is_none());
        assert!(state.wallet("0xaa").is_some());
        assert!(!state.is_dao_member("pi01", "pi02"));
        assert!(!state.receipt_included("digest"));

        // writes after a rollback are no longer journaled
        state.set_balance("0xaa", "TK", 5).unwrap();
        state.rollback();
        assert_eq!(state.balance("0xaa", "TK"), 5);
    }

    #[test]
    fn test_transfer_skips_self_and_zero_sender() {
        let mut state = LedgerState::new();
        state.set_balance("0xaa", "TK", 10).unwrap();
        state.transfer("0xaa", "0xaa", "TK", 10).unwrap();
        state.transfer(ZERO_ADDRESS, "0xaa", "TK", 10).unwrap();
        assert_eq!(state.balance("0xaa", "TK"), 10);
    }

    #[test]
    fn test_miner_upsert_is_freshness_guarded() {
        let mut state = LedgerState::new();
        let miner = |ts| MinerRecord {
            wallet_address: "0xaa".into(),
            network_address: format!("10.0.0.1:{}", ts),
            last_broadcast_timestamp: ts,
            block_index: 1,
        };
        assert!(state.upsert_miner(miner(10)));
        assert!(!state.upsert_miner(miner(5)));
        assert!(!state.upsert_miner(miner(10)));
        assert!(state.upsert_miner(miner(11)));
        assert_eq!(state.miner("0xaa").unwrap().last_broadcast_timestamp, 11);
    }

    #[test]
    fn test_contract_addresses_count_as_wallets_when_asked() {
        let mut state = LedgerState::new();
        state.insert_contract(ContractRecord {
            address: "ct01".into(),
            name: "vault".into(),
            creator: "0xaa".into(),
            signatories: BTreeMap::new(),
            parent: "tx".into(),
        });
        state.insert_wallet(wallet("0xaa"));

        assert!(state.is_wallet_valid("ct01", true));
        assert!(!state.is_wallet_valid("ct01", false));
        assert!(state.is_wallet_valid("0xaa", false));
        assert_eq!(state.wallet_by_public_key("pk-0xaa").unwrap().wallet_address, "0xaa");
    }

    #[test]
    fn test_cursor_commit_publishes() {
        let store = LedgerStore::new();
        {
            let mut cursor = store.begin();
            cursor.insert_wallet(wallet("0xaa"));
            cursor.commit();
        }
        assert!(store.read().wallet("0xaa").is_some());
    }

    #[test]
    fn test_dropped_cursor_discards() {
        let store = LedgerStore::new();
        {
            let mut cursor = store.begin();
            cursor.insert_wallet(wallet("0xaa"));
            assert!(cursor.wallet("0xaa").is_some());
        }
        assert!(store.read().wallet("0xaa").is_none());
        // writer lock was released
        let cursor = store.begin();
        cursor.commit();
    }
}
