//! Slot role selection
//!
//! The expected miner and the committee are drawn from the miners whose last
//! broadcast is fresh, weighted by network trust score. Freshness is measured
//! against the last committed block's timestamp and draws are seeded by its
//! hash, so every node with the same ledger picks the same roles whatever its
//! local clock says.

use pchain_runtime::{LedgerRead, SlotRoles, TrustScoreManager};
use pchain_types::{ChainParams, MinerRecord};

#[derive(Debug, Clone)]
pub struct MinerSelection {
    committee_size: usize,
    broadcast_interval_ms: i64,
}

impl MinerSelection {
    pub fn new(params: &ChainParams) -> Self {
        Self {
            committee_size: params.committee_size,
            broadcast_interval_ms: params.miner_broadcast_interval_ms,
        }
    }

    /// Miners heard from within the broadcast interval before the last
    /// committed block, by address. Every registered miner on an empty chain.
    pub fn eligible_miners<'a>(&self, ledger: &'a dyn LedgerRead) -> Vec<&'a MinerRecord> {
        let cutoff = ledger
            .last_block()
            .map(|b| b.timestamp.saturating_sub(self.broadcast_interval_ms))
            .unwrap_or(i64::MIN);
        let mut miners: Vec<&MinerRecord> = ledger
            .miners()
            .into_iter()
            .filter(|m| m.last_broadcast_timestamp >= cutoff)
            .collect();
        miners.sort_by(|a, b| a.wallet_address.cmp(&b.wallet_address));
        miners
    }

    /// Roles for the slot after the last committed block
    pub fn select(&self, ledger: &dyn LedgerRead, trust: &TrustScoreManager) -> SlotRoles {
        let seed = ledger
            .last_block()
            .map(|b| b.hash.clone())
            .unwrap_or_default();

        let mut candidates: Vec<(String, u128)> = self
            .eligible_miners(ledger)
            .into_iter()
            .map(|m| {
                // negative or zero trust still leaves a minimal chance
                let weight = trust.network_score(ledger, &m.wallet_address).max(1) as u128;
                (m.wallet_address.clone(), weight)
            })
            .collect();

        let mut drawn = Vec::with_capacity(self.committee_size + 1);
        let mut round = 0u64;
        while !candidates.is_empty() && drawn.len() <= self.committee_size {
            let total: u128 = candidates.iter().map(|(_, w)| w).sum();
            let mut pick = draw(&seed, round) % total;
            let position = candidates
                .iter()
                .position(|(_, weight)| {
                    if pick < *weight {
                        true
                    } else {
                        pick -= *weight;
                        false
                    }
                })
                .unwrap_or(0);
            drawn.push(candidates.remove(position).0);
            round += 1;
        }

        let mut drawn = drawn.into_iter();
        SlotRoles {
            expected_miner: drawn.next(),
            committee: drawn.collect(),
        }
    }
}

/// Deterministic pseudo-random number for draw `round` under `seed`
fn draw(seed: &str, round: u64) -> u128 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(seed.as_bytes());
    hasher.update(&round.to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    u128::from_le_bytes(bytes)
}
