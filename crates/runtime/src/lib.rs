//! Chain Runtime - ledger, validation and block-level state transitions
//!
//! This crate provides the node core that sits below consensus:
//! - Ledger Store with single-writer cursors and sled snapshots
//! - Transaction validation (signatures + economics)
//! - State transitions, block rewards, trust scoring and stake slashing
//! - Mempool, proposal/receipt staging and block proposal

pub mod block_proposer;
pub mod chain;
pub mod contracts;
pub mod ledger_store;
pub mod mempool;
pub mod persistence;
pub mod slashing;
pub mod staging;
pub mod state_transition;
pub mod trust;
pub mod tx_validator;

#[cfg(test)]
mod tests;

pub use block_proposer::{BlockProposer, DropReason, SlotRoles};
pub use chain::{ChainCore, ChainError};
pub use contracts::{CallContext, ContractRegistry, ContractRuntime};
pub use ledger_store::{LedgerCursor, LedgerRead, LedgerState, LedgerStore};
pub use mempool::{Mempool, MempoolSender};
pub use persistence::{ChainMetadata, LedgerPersistence, PersistentStore};
pub use slashing::{slash, Offense};
pub use staging::{StagingArea, StagingError};
pub use state_transition::{block_reward, ApplyOutcome, StateTransitionEngine};
pub use trust::{DefaultScoringPolicy, ScoringPolicy, TrustEvent, TrustScoreManager};
pub use tx_validator::{TransactionValidator, Verdict};

/// Blocks between two ledger snapshots
pub const SNAPSHOT_EVERY_BLOCKS: u64 = 10;
