//! Chain Types - ledger data model shared by every node component
//!
//! Contents:
//! - Ledger rows: wallets, persons, tokens, trust scores, miners, stakes, contracts
//! - Transactions as a tagged union over the enumerated kinds
//! - Block, receipt and payload envelopes
//! - Crypto provider, corrected clock and chain parameters

pub mod block;
pub mod clock;
pub mod crypto;
pub mod error;
pub mod params;
pub mod state;
pub mod transaction;

pub use block::{Block, BlockBody, BlockPayload, BlockStatus, Receipt, ReceiptData, Vote};
pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::{CryptoProvider, Ed25519Provider, KeyPair};
pub use error::{ContractError, LedgerError, ValidationError};
pub use params::{ChainParams, Network};
pub use state::{
    BlockRecord, ContractRecord, KycDoc, MinerRecord, Person, StakeEntry, StakerShare,
    TokenRecord, TrustScore, WalletRecord,
};
pub use transaction::{
    ContractCall, ContractParams, MinerAddition, SignedTransaction, TokenCreation, Transaction,
    TransactionKind, Transfer, TrustScoreChange, TxSignature, ValueTransfer, WalletAttributes,
    WalletCreation,
};

/// Constants
pub mod constants {
    /// Reported in block payloads and miner broadcasts
    pub const SOFTWARE_VERSION: &str = "1.0.10";

    /// Burn sink / "no counterparty" address
    pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

    /// Network token code and name
    pub const NETWORK_TOKEN_CODE: &str = "NWRL";
    pub const NETWORK_TOKEN_NAME: &str = "NEWRL";

    // Trust scores
    /// Score ceiling (and negated floor)
    pub const MAX_NETWORK_TRUST_SCORE: i64 = 1_000_000;
    /// Score used when no row exists yet
    pub const INITIAL_NETWORK_TRUST_SCORE: i64 = 100_000;

    // Block production
    /// Maximum transactions (plus receipts) per block
    pub const MAX_BLOCK_SIZE: usize = 100;
    /// Proof marker of an empty fallback block
    pub const EMPTY_BLOCK_PROOF: u64 = 42;
    /// Miner broadcasts referencing a block further behind than this are dropped
    pub const MAX_MINER_BLOCK_LAG: u64 = 300;

    // Block reward
    pub const STARTING_REWARD: i64 = 1000;
    pub const REWARD_DECAY_BLOCKS: u64 = 1_000_000;

    // Address prefixes
    pub const WALLET_PREFIX: &str = "0x";
    pub const CONTRACT_PREFIX: &str = "ct";
    pub const PERSON_PREFIX: &str = "pi";
    pub const TOKEN_PREFIX: &str = "tk";
}
