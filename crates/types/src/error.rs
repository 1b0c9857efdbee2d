//! Error taxonomy
//!
//! - [`ValidationError`]: a transaction is rejected, processing continues
//! - [`LedgerError`]: integrity failure, the block must not be committed
//! - [`ContractError`]: isolated to one contract call

use thiserror::Error;

/// Why a transaction was judged invalid
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("transaction code does not match its content")]
    CodeMismatch,

    #[error("transaction {0} already recorded on-chain")]
    AlreadyOnChain(String),

    #[error("sender and receiver cannot be the same wallet")]
    SameSender,

    #[error("cannot resolve required signers: {0}")]
    UnresolvableSigners(String),

    #[error("missing signature from required signer {0}")]
    MissingSignature(String),

    #[error("invalid signature from {0}")]
    InvalidSignature(String),

    #[error("no public key on file for {0}")]
    UnknownSigner(String),

    #[error("fee must be paid in {expected}, got {got}")]
    FeeCurrency { expected: String, got: String },

    #[error("fee {fee} below minimum {minimum}")]
    FeeTooLow { fee: i64, minimum: i64 },

    #[error("{0} is not an authorized custodian")]
    UnauthorizedCustodian(String),

    #[error("linked wallet must be created by its parent wallet")]
    LinkedWalletCustodian,

    #[error("wallet {0} already exists")]
    WalletExists(String),

    #[error("unknown wallet {0}")]
    UnknownWallet(String),

    #[error("unknown token {0}")]
    UnknownToken(String),

    #[error("amount cannot be non-zero without a first owner")]
    AmountWithoutOwner,

    #[error("custodian for token {0} is someone else")]
    TokenCustodianMismatch(String),

    #[error("token quantity cannot be negative")]
    NegativeAmount,

    #[error("insufficient balance in {wallet} for {token}: need {needed}, have {available}")]
    InsufficientBalance {
        wallet: String,
        token: String,
        needed: i64,
        available: i64,
    },

    #[error("amounts of {token} owed by {wallet} overflow")]
    AmountOverflow { wallet: String, token: String },

    #[error("wallet {0} has no person id")]
    MissingPersonId(String),

    #[error("source and destination person cannot be the same")]
    SamePerson,

    #[error("trust score {0} out of range")]
    ScoreOutOfRange(i64),

    #[error("contract rejected call: {0}")]
    Contract(String),
}

/// Ledger integrity failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("block {index} already committed with a different hash")]
    DuplicateBlockIndex { index: u64 },

    #[error("block gap: expected index {expected}, got {got}")]
    NonSequentialBlock { expected: u64, got: u64 },

    #[error("block {index} does not extend the committed chain")]
    BrokenLink { index: u64 },

    #[error("unknown wallet {0}")]
    UnknownWallet(String),

    #[error("unknown token {0}")]
    UnknownToken(String),

    #[error("wallet {0} has no person id")]
    UnknownPerson(String),

    #[error("balance of {wallet} in {token} would become negative")]
    NegativeBalance { wallet: String, token: String },

    #[error("{token} amount for {wallet} overflows")]
    AmountOverflow { wallet: String, token: String },

    #[error("unknown contract {0}")]
    UnknownContract(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Failures raised by or around a smart-contract call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("no execution module registered under {0}")]
    NotRegistered(String),

    #[error("contract {0} does not exist")]
    UnknownContract(String),

    #[error("function {function} not callable on {contract}")]
    UnknownFunction { contract: String, function: String },

    #[error("contract validation failed: {0}")]
    Validation(String),

    #[error("contract execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
