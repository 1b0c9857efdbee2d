//! Stake slashing
//!
//! A penalty is spread over every staker share of a wallet's stake in
//! proportion to the share, each burn rounded up. Burned stake leaves the
//! stake contract for the network treasury.

use pchain_types::constants::NETWORK_TOKEN_CODE;
use pchain_types::{ChainParams, LedgerError, StakeEntry};

use crate::ledger_store::{LedgerRead, LedgerState};

/// What the staked node did wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offense {
    /// Produced an invalid block: the full minimum stake
    Block,
    /// Cast a wrong receipt: minimum stake over the penalty ratio
    Receipt,
}

impl Offense {
    pub fn penalty(&self, params: &ChainParams) -> i64 {
        match self {
            Offense::Block => params.min_stake_amount,
            Offense::Receipt => params.min_stake_amount / params.stake_penalty_ratio.max(1),
        }
    }
}

/// Slash the stake of `wallet`. Returns `Ok(false)` without touching the
/// ledger when there is nothing to slash or the stake is already below the
/// minimum.
pub fn slash(ledger: &mut LedgerState, params: &ChainParams, wallet: &str, offense: Offense) -> Result<bool, LedgerError> {
    let Some(entry) = ledger.stake(wallet).cloned() else {
        tracing::warn!("no stake entry for {}, nothing to slash", wallet);
        return Ok(false);
    };
    if entry.amount <= 0 || entry.amount < params.min_stake_amount {
        tracing::warn!(
            "stake of {} is {} (minimum {}), not slashing",
            wallet,
            entry.amount,
            params.min_stake_amount
        );
        return Ok(false);
    }

    let penalty = offense.penalty(params);
    let aggregate = entry.amount as i128;
    let mut total_burn = 0i64;
    let mut stakers = entry.stakers.clone();
    for share in stakers.iter_mut() {
        let numerator = share.amount as i128 * penalty as i128;
        let burn = ((numerator + aggregate - 1) / aggregate) as i64;
        let burn = burn.min(share.amount).max(0);
        share.amount -= burn;
        total_burn = total_burn.saturating_add(burn);
    }

    ledger.transfer(
        &params.stake_contract_address,
        &params.network_treasury_address,
        NETWORK_TOKEN_CODE,
        total_burn,
    )?;
    ledger.put_stake(StakeEntry {
        wallet_address: entry.wallet_address,
        amount: (entry.amount - total_burn).max(0),
        stakers,
    });

    tracing::info!("Slashed {} from {} for {:?} offense", total_burn, wallet, offense);
    Ok(true)
}
