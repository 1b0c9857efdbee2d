//! State transition engine
//!
//! Applies a block's already validated transactions to a ledger working copy:
//! record the block, mint the creator's reward, settle fees, dispatch every
//! transaction by kind and finally score the receipts the block carries.
//!
//! Any [`LedgerError`] leaves the working copy half-written; the caller must
//! drop it instead of committing. Contract failures are the exception: they
//! roll back to a checkpoint taken before the call and the block goes on.

use std::sync::Arc;

use pchain_types::constants::{NETWORK_TOKEN_CODE, NETWORK_TOKEN_NAME, REWARD_DECAY_BLOCKS};
use pchain_types::crypto::{derived_contract_address, derived_token_code, person_id_for_wallet};
use pchain_types::{
    Block, ChainParams, ContractCall, ContractError, ContractRecord, LedgerError, MinerAddition,
    MinerRecord, Person, TokenCreation, TokenRecord, Transaction, TransactionKind, Transfer,
    TrustScore, TrustScoreChange, WalletCreation, WalletRecord,
};

use crate::contracts::{CallContext, ContractRegistry};
use crate::ledger_store::{LedgerRead, LedgerState};
use crate::trust::TrustScoreManager;
use crate::tx_validator::fee_debits;

/// Result of applying one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        index: u64,
        hash: String,
        transactions: usize,
        /// Contract calls that failed and were rolled back
        contract_failures: usize,
        receipts_scored: usize,
    },
    /// The same block was committed before; nothing changed
    AlreadyApplied { index: u64 },
}

/// Creator reward for block `index`: `starting_reward * (2/3)^(step - 1)`
/// with `step = ceil(index / 1_000_000)`, floored.
pub fn block_reward(starting_reward: i64, index: u64) -> i64 {
    let step = index.div_ceil(REWARD_DECAY_BLOCKS).max(1);
    // (2/3)^40 of any sane reward is already below 1
    if step > 40 || starting_reward <= 0 {
        return 0;
    }
    let halvings = (step - 1) as u32;
    let numerator = starting_reward as u128 * 2u128.pow(halvings);
    let denominator = 3u128.pow(halvings);
    (numerator / denominator) as i64
}

pub struct StateTransitionEngine {
    params: Arc<ChainParams>,
    contracts: Arc<ContractRegistry>,
    trust: Arc<TrustScoreManager>,
}

impl StateTransitionEngine {
    pub fn new(params: Arc<ChainParams>, contracts: Arc<ContractRegistry>, trust: Arc<TrustScoreManager>) -> Self {
        Self {
            params,
            contracts,
            trust,
        }
    }

    pub fn apply_block(&self, ledger: &mut LedgerState, block: &Block) -> Result<ApplyOutcome, LedgerError> {
        let Some(hash) = self.open_block(ledger, block)? else {
            return Ok(ApplyOutcome::AlreadyApplied { index: block.index });
        };

        let mut contract_failures = 0;
        for signed in &block.body.transactions {
            let creator = block.creator_wallet.as_deref();
            if !self.apply_transaction(ledger, &signed.transaction, creator, block.index)? {
                contract_failures += 1;
            }
        }

        let receipts_scored = self
            .trust
            .update_from_receipts(ledger, &block.body.previous_block_receipts);

        tracing::info!(
            "Applied block {} ({} txs, {} receipts scored, {} contract failures)",
            block.index,
            block.body.transactions.len(),
            receipts_scored,
            contract_failures
        );

        Ok(ApplyOutcome::Applied {
            index: block.index,
            hash,
            transactions: block.body.transactions.len(),
            contract_failures,
            receipts_scored,
        })
    }

    /// Link checks, the block row, its transaction codes and the creator
    /// reward. Returns the block hash, or `None` when the same block is
    /// already committed. Transactions are left to the caller.
    pub fn open_block(&self, ledger: &mut LedgerState, block: &Block) -> Result<Option<String>, LedgerError> {
        let hash = block.compute_hash();

        if let Some(existing) = ledger.block(block.index) {
            if existing.hash == hash {
                tracing::debug!("block {} already applied", block.index);
                return Ok(None);
            }
            tracing::error!(
                "block {} already committed as {}, refusing {}",
                block.index,
                existing.hash,
                hash
            );
            return Err(LedgerError::DuplicateBlockIndex { index: block.index });
        }
        let expected = ledger.last_block().map(|b| b.block_index + 1).unwrap_or(1);
        if block.index != expected {
            tracing::error!("block gap: expected {}, got {}", expected, block.index);
            return Err(LedgerError::NonSequentialBlock {
                expected,
                got: block.index,
            });
        }
        if let Some(last) = ledger.last_block() {
            if last.hash != block.previous_hash {
                tracing::error!("block {} points at {}, tip is {}", block.index, block.previous_hash, last.hash);
                return Err(LedgerError::BrokenLink { index: block.index });
            }
        }

        ledger.record_block(block.to_record(&hash));
        for signed in &block.body.transactions {
            ledger.record_transaction(signed.code(), block.index);
        }

        if let Some(creator) = &block.creator_wallet {
            let reward = block_reward(self.params.starting_reward, block.index);
            if reward > 0 {
                self.mint_reward(ledger, creator, reward, &hash)?;
            }
        }
        Ok(Some(hash))
    }

    /// Settle the fee of `tx` and dispatch it. Returns `false` when a contract
    /// call failed and was rolled back.
    pub fn apply_transaction(
        &self,
        ledger: &mut LedgerState,
        tx: &Transaction,
        creator: Option<&str>,
        block_index: u64,
    ) -> Result<bool, LedgerError> {
        self.settle_fee(ledger, tx, creator)?;
        self.dispatch(ledger, tx, block_index)
    }

    /// Fees go to the block creator, or the treasury for creatorless blocks
    fn settle_fee(&self, ledger: &mut LedgerState, tx: &Transaction, creator: Option<&str>) -> Result<(), LedgerError> {
        let recipient = creator.unwrap_or(&self.params.treasury_wallet_address);
        for (payer, amount) in fee_debits(tx) {
            ledger.transfer(&payer, recipient, NETWORK_TOKEN_CODE, amount)?;
        }
        Ok(())
    }

    fn dispatch(&self, ledger: &mut LedgerState, tx: &Transaction, block_index: u64) -> Result<bool, LedgerError> {
        match &tx.kind {
            TransactionKind::WalletCreation(w) => self.create_wallet(ledger, w, tx.timestamp)?,
            TransactionKind::TokenCreation(t) => self.create_token(ledger, t, &tx.code)?,
            TransactionKind::TwoWayTransfer(t) => {
                transfer_leg(ledger, &t.wallet1, &t.wallet2, &t.asset1_code, t.asset1_number)?;
                transfer_leg(ledger, &t.wallet2, &t.wallet1, &t.asset2_code, t.asset2_number)?;
            }
            TransactionKind::OneWayTransfer(Transfer {
                wallet1,
                wallet2,
                asset1_code,
                asset1_number,
                ..
            }) => transfer_leg(ledger, wallet1, wallet2, asset1_code, *asset1_number)?,
            TransactionKind::TrustScoreChange(c) => self.change_trust(ledger, c, tx.timestamp)?,
            TransactionKind::MinerAddition(m) => self.add_miner(ledger, m, block_index),
            TransactionKind::SmartContract(call) | TransactionKind::ScUpdate(call) => {
                ledger.checkpoint();
                match self.call_contract(ledger, call, tx) {
                    Ok(()) => ledger.release(),
                    Err(ContractError::Ledger(e)) if is_integrity(&e) => {
                        ledger.release();
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!("contract call {} in {} failed: {}", call.function, tx.code, e);
                        ledger.rollback();
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    fn create_wallet(&self, ledger: &mut LedgerState, w: &WalletCreation, timestamp: i64) -> Result<(), LedgerError> {
        let person_id = if w.attributes.linked_wallet {
            let parent = w
                .attributes
                .parent_address
                .as_deref()
                .unwrap_or(&w.custodian_wallet);
            ledger
                .person_id(parent)
                .map(str::to_string)
                .ok_or_else(|| LedgerError::UnknownPerson(parent.to_string()))?
        } else {
            let person_id = person_id_for_wallet(&w.wallet_address);
            ledger.insert_person(Person {
                person_id: person_id.clone(),
                created_time: timestamp,
            });
            person_id
        };

        if !ledger.is_smart_contract(&w.wallet_address) {
            let mut attributes = w.attributes.extra.clone();
            attributes.insert("linked_wallet".into(), w.attributes.linked_wallet.into());
            if let Some(parent) = &w.attributes.parent_address {
                attributes.insert("parent_address".into(), parent.clone().into());
            }
            ledger.insert_wallet(WalletRecord {
                wallet_address: w.wallet_address.clone(),
                wallet_public: w.wallet_public.clone(),
                custodian_wallet: w.custodian_wallet.clone(),
                kyc_docs: w.kyc_docs.clone(),
                owner_type: w.owner_type,
                jurisdiction: w.jurisdiction,
                attributes,
            });
        }
        ledger.link_wallet(&person_id, &w.wallet_address);
        tracing::debug!("wallet {} created for {}", w.wallet_address, person_id);
        Ok(())
    }

    /// New token when the code is free, otherwise a top-up of the existing one
    fn create_token(&self, ledger: &mut LedgerState, t: &TokenCreation, tx_code: &str) -> Result<(), LedgerError> {
        let code = t
            .requested_code()
            .map(str::to_string)
            .unwrap_or_else(|| derived_token_code(tx_code));

        let mint_to_owner = t.amount_created > 0 && t.first_owner.is_some();
        if ledger.token(&code).is_none() {
            ledger.insert_token(TokenRecord {
                tokencode: code.clone(),
                token_name: t.token_name.clone(),
                token_type: t.token_type.clone(),
                first_owner: t.first_owner.clone(),
                custodian: t.custodian.clone(),
                legal_doc_hash: t.legal_doc_hash.clone(),
                amount_created: t.amount_created.max(0),
                sc_flag: t.sc_flag,
                disallowed: t.disallowed.clone(),
                parent_transaction_code: Some(tx_code.to_string()),
                decimals: t.decimals,
                attributes: t.attributes.clone(),
            });
            tracing::debug!("token {} created", code);
        } else if mint_to_owner {
            ledger.add_token_amount(&code, t.amount_created)?;
        }

        if let (true, Some(owner)) = (mint_to_owner, &t.first_owner) {
            ledger.credit(owner, &code, t.amount_created)?;
        }
        Ok(())
    }

    fn mint_reward(&self, ledger: &mut LedgerState, creator: &str, reward: i64, block_hash: &str) -> Result<(), LedgerError> {
        let reward_tx = TokenCreation {
            tokencode: Some(NETWORK_TOKEN_CODE.to_string()),
            token_name: NETWORK_TOKEN_NAME.to_string(),
            token_type: "1".to_string(),
            first_owner: Some(creator.to_string()),
            custodian: self.params.treasury_wallet_address.clone(),
            legal_doc_hash: String::new(),
            amount_created: reward,
            disallowed: vec![],
            decimals: 0,
            attributes: Default::default(),
            sc_flag: false,
        };
        self.create_token(ledger, &reward_tx, block_hash)
    }

    fn change_trust(&self, ledger: &mut LedgerState, c: &TrustScoreChange, timestamp: i64) -> Result<(), LedgerError> {
        let src = ledger
            .person_id(&c.address1)
            .map(str::to_string)
            .ok_or_else(|| LedgerError::UnknownPerson(c.address1.clone()))?;
        let dest = ledger
            .person_id(&c.address2)
            .map(str::to_string)
            .ok_or_else(|| LedgerError::UnknownPerson(c.address2.clone()))?;
        ledger.upsert_trust_score(TrustScore {
            src_person_id: src,
            dest_person_id: dest,
            score: self.trust.clamp(c.new_score),
            last_time: timestamp,
        });
        Ok(())
    }

    fn add_miner(&self, ledger: &mut LedgerState, m: &MinerAddition, block_index: u64) {
        let fresh = ledger.upsert_miner(MinerRecord {
            wallet_address: m.wallet_address.clone(),
            network_address: m.network_address.clone(),
            last_broadcast_timestamp: m.broadcast_timestamp,
            block_index,
        });
        if !fresh {
            tracing::debug!("stale miner broadcast from {}", m.wallet_address);
        }

        if let Some(person_id) = ledger.person_id(&m.wallet_address).map(str::to_string) {
            ledger.insert_trust_score_if_absent(TrustScore {
                src_person_id: self.params.network_trust_manager_pid.clone(),
                dest_person_id: person_id,
                score: self.params.initial_trust_score,
                last_time: m.broadcast_timestamp,
            });
        }
    }

    fn call_contract(&self, ledger: &mut LedgerState, call: &ContractCall, tx: &Transaction) -> Result<(), ContractError> {
        let (address, name, callers) = if call.is_setup() {
            let name = call
                .params
                .contract_name
                .clone()
                .ok_or_else(|| ContractError::Validation("setup without contract_name".into()))?;
            let creator = call
                .params
                .creator
                .clone()
                .ok_or_else(|| ContractError::Validation("setup without creator".into()))?;
            let address = call
                .address
                .clone()
                .unwrap_or_else(|| derived_contract_address(&tx.code));
            let signatories = match call.params.extra.get("signatories") {
                Some(value) => serde_json::from_value(value.clone())
                    .map_err(|e| ContractError::Validation(format!("bad signatories: {}", e)))?,
                None => Default::default(),
            };
            ledger.insert_contract(ContractRecord {
                address: address.clone(),
                name: name.clone(),
                creator: creator.clone(),
                signatories,
                parent: tx.code.clone(),
            });
            (address, name, vec![creator])
        } else {
            let address = call
                .address
                .clone()
                .ok_or_else(|| ContractError::UnknownContract(String::new()))?;
            let contract = ledger
                .contract(&address)
                .ok_or_else(|| ContractError::UnknownContract(address.clone()))?;
            (address.clone(), contract.name.clone(), call.signers.clone())
        };
        let runtime = self.contracts.resolve(&name)?;

        if let Some(payer) = callers.first() {
            for value in &call.params.value {
                transfer_leg(ledger, payer, &address, &value.token_code, value.amount)?;
            }
        }

        let mut params = serde_json::to_value(&call.params).map_err(|e| ContractError::Validation(e.to_string()))?;
        if let Some(fields) = params.as_object_mut() {
            fields.insert("function_caller".into(), callers.into());
        }
        let ctx = CallContext {
            address,
            transaction_code: tx.code.clone(),
            timestamp: tx.timestamp,
        };
        runtime.call(&ctx, &call.function, &params, ledger)
    }
}

/// Zero-amount legs are skipped
fn transfer_leg(ledger: &mut LedgerState, from: &str, to: &str, token: &str, amount: i64) -> Result<(), LedgerError> {
    if amount == 0 {
        return Ok(());
    }
    ledger.transfer(from, to, token, amount)
}

/// Errors that mean the store itself is broken rather than the contract
fn is_integrity(error: &LedgerError) -> bool {
    matches!(
        error,
        LedgerError::Storage(_)
            | LedgerError::DuplicateBlockIndex { .. }
            | LedgerError::NonSequentialBlock { .. }
            | LedgerError::BrokenLink { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_reward_decays_by_two_thirds() {
        assert_eq!(block_reward(1000, 0), 1000);
        assert_eq!(block_reward(1000, 1), 1000);
        assert_eq!(block_reward(1000, 1_000_000), 1000);
        assert_eq!(block_reward(1000, 1_000_001), 666);
        assert_eq!(block_reward(1000, 2_000_001), 444);
        assert_eq!(block_reward(1000, 40_000_001), 0);
        assert_eq!(block_reward(1000, u64::MAX), 0);
    }
}
