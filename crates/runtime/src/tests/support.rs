//! Shared fixtures: three funded wallets on a fresh ledger and a manual clock

use std::collections::BTreeMap;
use std::sync::Arc;

use pchain_types::constants::{NETWORK_TOKEN_CODE, NETWORK_TOKEN_NAME};
use pchain_types::crypto::person_id_for_wallet;
use pchain_types::{
    Block, BlockBody, BlockStatus, ChainParams, Clock, Ed25519Provider, KeyPair, LedgerError,
    ManualClock, Person, SignedTransaction, TokenRecord, Transaction, TransactionKind, Transfer,
    WalletRecord,
};

use crate::block_proposer::{BlockProposer, SlotRoles};
use crate::chain::ChainCore;
use crate::contracts::{ContractRegistry, ContractRuntime};
use crate::ledger_store::{LedgerRead, LedgerState, LedgerStore};
use crate::mempool::Mempool;
use crate::staging::StagingArea;
use crate::state_transition::{ApplyOutcome, StateTransitionEngine};
use crate::trust::TrustScoreManager;
use crate::tx_validator::TransactionValidator;

pub const START_TIME: i64 = 1_700_000_000_000;
pub const STARTING_BALANCE: i64 = 1_000;

/// A wallet with its keys
#[derive(Debug, Clone)]
pub struct Actor {
    pub keys: KeyPair,
    pub address: String,
}

impl Actor {
    pub fn from_seed(seed: u8) -> Self {
        let keys = KeyPair::from_secret_bytes([seed; 32]);
        let address = keys.address();
        Self { keys, address }
    }

    pub fn person_id(&self) -> String {
        person_id_for_wallet(&self.address)
    }
}

pub fn one_way(from: &str, to: &str, amount: i64) -> TransactionKind {
    TransactionKind::OneWayTransfer(Transfer {
        wallet1: from.to_string(),
        wallet2: to.to_string(),
        asset1_code: NETWORK_TOKEN_CODE.to_string(),
        asset2_code: String::new(),
        asset1_number: amount,
        asset2_number: 0,
    })
}

pub fn two_way(from: &str, to: &str, give: (&str, i64), take: (&str, i64)) -> TransactionKind {
    TransactionKind::TwoWayTransfer(Transfer {
        wallet1: from.to_string(),
        wallet2: to.to_string(),
        asset1_code: give.0.to_string(),
        asset2_code: take.0.to_string(),
        asset1_number: give.1,
        asset2_number: take.1,
    })
}

pub fn wallet_record(actor: &Actor, custodian: &str) -> WalletRecord {
    WalletRecord {
        wallet_address: actor.address.clone(),
        wallet_public: actor.keys.public_hex(),
        custodian_wallet: custodian.to_string(),
        kyc_docs: vec![],
        owner_type: 1,
        jurisdiction: 1,
        attributes: BTreeMap::new(),
    }
}

pub fn token_record(code: &str, custodian: &str, amount: i64) -> TokenRecord {
    TokenRecord {
        tokencode: code.to_string(),
        token_name: code.to_string(),
        token_type: "1".into(),
        first_owner: None,
        custodian: custodian.to_string(),
        legal_doc_hash: String::new(),
        amount_created: amount,
        sc_flag: false,
        disallowed: vec![],
        parent_transaction_code: None,
        decimals: 0,
        attributes: BTreeMap::new(),
    }
}

/// Seed `actor` as a wallet with its own person id
pub fn seed_actor(state: &mut LedgerState, actor: &Actor, custodian: &str) {
    let person_id = actor.person_id();
    state.insert_wallet(wallet_record(actor, custodian));
    state.insert_person(Person {
        person_id: person_id.clone(),
        created_time: START_TIME,
    });
    state.link_wallet(&person_id, &actor.address);
}

pub struct Fixture {
    pub params: Arc<ChainParams>,
    pub crypto: Arc<Ed25519Provider>,
    pub clock: Arc<ManualClock>,
    pub contracts: Arc<ContractRegistry>,
    pub store: LedgerStore,
    pub mempool: Mempool,
    pub staging: StagingArea,
    pub custodian: Actor,
    pub alice: Actor,
    pub bob: Actor,
}

impl Fixture {
    pub fn new() -> Self {
        let custodian = Actor::from_seed(1);
        let alice = Actor::from_seed(2);
        let bob = Actor::from_seed(3);

        let params = ChainParams {
            min_fee: 1,
            min_stake_amount: 300,
            custodian_wallets: vec![custodian.address.clone()],
            treasury_wallet_address: custodian.address.clone(),
            ..ChainParams::default()
        };

        let mut state = LedgerState::new();
        for actor in [&custodian, &alice, &bob] {
            seed_actor(&mut state, actor, &custodian.address);
        }
        let mut nwrl = token_record(NETWORK_TOKEN_CODE, &custodian.address, 3 * STARTING_BALANCE);
        nwrl.token_name = NETWORK_TOKEN_NAME.to_string();
        state.insert_token(nwrl);
        for actor in [&custodian, &alice, &bob] {
            state
                .set_balance(&actor.address, NETWORK_TOKEN_CODE, STARTING_BALANCE)
                .unwrap();
        }

        let crypto = Arc::new(Ed25519Provider);
        Self {
            params: Arc::new(params),
            staging: StagingArea::new(crypto.clone()),
            crypto,
            clock: Arc::new(ManualClock::new(START_TIME)),
            contracts: Arc::new(ContractRegistry::new()),
            store: LedgerStore::from_state(state),
            mempool: Mempool::new(),
            custodian,
            alice,
            bob,
        }
    }

    pub fn set_params(&mut self, params: ChainParams) {
        self.params = Arc::new(params);
    }

    pub fn register(&mut self, name: &str, runtime: Arc<dyn ContractRuntime>) {
        let registry = (*self.contracts).clone().with(name, runtime);
        self.contracts = Arc::new(registry);
    }

    pub fn validator(&self) -> TransactionValidator {
        TransactionValidator::new(self.params.clone(), self.crypto.clone(), self.contracts.clone())
    }

    pub fn trust(&self) -> TrustScoreManager {
        TrustScoreManager::new(self.params.clone(), self.crypto.clone(), self.clock.clone())
    }

    pub fn engine(&self) -> StateTransitionEngine {
        StateTransitionEngine::new(self.params.clone(), self.contracts.clone(), Arc::new(self.trust()))
    }

    pub fn proposer(&self) -> BlockProposer {
        BlockProposer::new(
            self.params.clone(),
            Arc::new(self.validator()),
            Arc::new(self.engine()),
            self.clock.clone(),
        )
    }

    /// Propose from the fixture pool with the custodian as creator
    pub fn propose(&self) -> Option<Block> {
        let ledger = self.store.read();
        self.proposer().propose(
            &ledger,
            &self.mempool,
            &self.staging,
            &self.custodian.address,
            &SlotRoles::default(),
        )
    }

    /// A node core over a copy of the fixture ledger
    pub fn core(&self, keys: KeyPair) -> ChainCore {
        ChainCore::new(
            self.params.clone(),
            LedgerStore::from_state(self.store.read().clone()),
            self.contracts.clone(),
            self.crypto.clone(),
            self.clock.clone(),
            keys,
        )
    }

    pub fn sign(&self, kind: TransactionKind, signers: &[&Actor]) -> SignedTransaction {
        self.sign_at(kind, signers, self.clock.now_corrected_ms())
    }

    pub fn sign_at(&self, kind: TransactionKind, signers: &[&Actor], timestamp: i64) -> SignedTransaction {
        let mut signed = SignedTransaction::new(Transaction::new(kind, self.params.min_fee, timestamp));
        for actor in signers {
            signed.sign(&*self.crypto, &actor.keys, &actor.address);
        }
        signed
    }

    /// The next block over `transactions`, created by the custodian
    pub fn next_block(&self, transactions: Vec<SignedTransaction>) -> Block {
        let ledger = self.store.read();
        let last = ledger.last_block();
        Block {
            index: last.map(|b| b.block_index + 1).unwrap_or(1),
            timestamp: self.clock.now_corrected_ms(),
            status: BlockStatus::Normal,
            proof: 0,
            previous_hash: last.map(|b| b.hash.clone()).unwrap_or_else(|| "0".into()),
            creator_wallet: Some(self.custodian.address.clone()),
            expected_miner: None,
            committee: vec![],
            body: BlockBody {
                transactions,
                previous_block_receipts: vec![],
            },
        }
    }

    /// Apply `block` through a cursor, committing only on success
    pub fn apply(&self, block: &Block) -> Result<ApplyOutcome, LedgerError> {
        let engine = self.engine();
        let mut cursor = self.store.begin();
        let outcome = engine.apply_block(&mut cursor, block)?;
        cursor.commit();
        Ok(outcome)
    }

    pub fn balance(&self, wallet: &str, token: &str) -> i64 {
        self.store.read().balance(wallet, token)
    }
}
