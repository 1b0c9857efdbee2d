//! Chain Consensus - tick-driven block scheduling with committee voting
//!
//! Architecture:
//! - A global tick works out the expected miner and committee for the next
//!   slot and arms the matching timer
//! - Miners broadcast proposals, committee members vote with receipts
//! - A block commits once enough receipts agree on its hash
//! - The sentinel node covers for missing miners with empty blocks
//! - Peers talk JSON over websockets

pub mod broadcast;
pub mod scheduler;
pub mod selection;
pub mod sync;
pub mod timers;
pub mod types;

#[cfg(test)]
mod tests;

pub use broadcast::{Inbound, NetworkStats, PeerBroadcaster, PeerNetwork};
pub use scheduler::{ConsensusScheduler, Housekeeping, NoHousekeeping};
pub use selection::MinerSelection;
pub use sync::{apply_synced_blocks, ChainSync, PeerSync, SYNC_BATCH};
pub use timers::{TimerKind, TimerTable};
pub use types::*;
