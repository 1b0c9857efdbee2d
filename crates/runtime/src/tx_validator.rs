//! Transaction validator
//!
//! A transaction is valid when both independent checks pass:
//! - signature check: every required signer has a signature over the
//!   canonical body that verifies with its on-file public key
//! - economic check: fee, existence, balance and range rules per kind
//!
//! Both checks always run so each failure is logged; the caller only sees
//! the verdict.

use std::collections::BTreeMap;
use std::sync::Arc;

use pchain_types::constants::{NETWORK_TOKEN_CODE, ZERO_ADDRESS};
use pchain_types::crypto::person_id_for_wallet;
use pchain_types::{
    ChainParams, ContractCall, CryptoProvider, SignedTransaction, TokenCreation, Transaction,
    TransactionKind, Transfer, TrustScoreChange, ValidationError, WalletCreation,
};

use crate::contracts::ContractRegistry;
use crate::ledger_store::LedgerRead;

/// Outcome of validating one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(ValidationError),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }

    pub fn into_result(self) -> Result<(), ValidationError> {
        match self {
            Verdict::Valid => Ok(()),
            Verdict::Invalid(reason) => Err(reason),
        }
    }
}

/// Half the fee, rounded up: what each side of a two-way transfer pays
pub fn half_fee(fee: i64) -> i64 {
    fee / 2 + fee % 2
}

/// Who pays how much of the fee, in the network token
pub fn fee_debits(tx: &Transaction) -> Vec<(String, i64)> {
    if !tx.pays_fee() || tx.fee <= 0 {
        return Vec::new();
    }
    match &tx.kind {
        TransactionKind::TwoWayTransfer(t) => vec![
            (t.wallet1.clone(), half_fee(tx.fee)),
            (t.wallet2.clone(), half_fee(tx.fee)),
        ],
        TransactionKind::OneWayTransfer(t) => vec![(t.wallet1.clone(), tx.fee)],
        TransactionKind::WalletCreation(w) => vec![(w.custodian_wallet.clone(), tx.fee)],
        TransactionKind::TokenCreation(t) => vec![(t.custodian.clone(), tx.fee)],
        TransactionKind::TrustScoreChange(c) => vec![(c.address1.clone(), tx.fee)],
        TransactionKind::SmartContract(call) => {
            let payer = if call.is_setup() {
                call.params.creator.clone()
            } else {
                call.signers.first().cloned()
            };
            payer.map(|p| vec![(p, tx.fee)]).unwrap_or_default()
        }
        TransactionKind::MinerAddition(_) | TransactionKind::ScUpdate(_) => Vec::new(),
    }
}

/// Signature and economic validation
pub struct TransactionValidator {
    params: Arc<ChainParams>,
    crypto: Arc<dyn CryptoProvider>,
    contracts: Arc<ContractRegistry>,
}

impl TransactionValidator {
    pub fn new(params: Arc<ChainParams>, crypto: Arc<dyn CryptoProvider>, contracts: Arc<ContractRegistry>) -> Self {
        Self {
            params,
            crypto,
            contracts,
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Full verdict: signature check AND economic check
    pub fn validate(&self, signed: &SignedTransaction, ledger: &dyn LedgerRead) -> Verdict {
        let code = signed.code();
        let signatures = self.check_signatures(signed, ledger);
        if let Err(reason) = &signatures {
            tracing::debug!(tx = %code, "signature check failed: {}", reason);
        }
        let economics = self.check_economics(&signed.transaction, ledger);
        if let Err(reason) = &economics {
            tracing::debug!(tx = %code, "economic check failed: {}", reason);
        }

        match signatures.and(economics) {
            Ok(()) => Verdict::Valid,
            Err(reason) => Verdict::Invalid(reason),
        }
    }

    /// Addresses that must sign `tx`
    pub fn required_signers(&self, tx: &Transaction, ledger: &dyn LedgerRead) -> Result<Vec<String>, ValidationError> {
        let signers = match &tx.kind {
            TransactionKind::WalletCreation(w) => vec![w.custodian_wallet.clone()],
            TransactionKind::TokenCreation(t) => vec![t.custodian.clone()],
            TransactionKind::TwoWayTransfer(t) => {
                if t.wallet1 == t.wallet2 {
                    return Err(ValidationError::SameSender);
                }
                vec![t.wallet1.clone(), t.wallet2.clone()]
            }
            TransactionKind::OneWayTransfer(t) => vec![t.wallet1.clone()],
            TransactionKind::TrustScoreChange(c) => vec![c.address1.clone()],
            TransactionKind::MinerAddition(m) => vec![m.wallet_address.clone()],
            TransactionKind::SmartContract(call) | TransactionKind::ScUpdate(call) => {
                self.contract_signers(call, ledger)?
            }
        };
        Ok(signers)
    }

    fn contract_signers(&self, call: &ContractCall, ledger: &dyn LedgerRead) -> Result<Vec<String>, ValidationError> {
        if call.is_setup() {
            return call
                .params
                .creator
                .clone()
                .map(|creator| vec![creator])
                .ok_or_else(|| ValidationError::UnresolvableSigners("setup call without a creator".into()));
        }

        let address = call.address.as_deref().ok_or_else(|| {
            ValidationError::UnresolvableSigners("call to a contract that is not set up".into())
        })?;
        let contract = ledger.contract(address).ok_or_else(|| {
            ValidationError::UnresolvableSigners(format!("contract {} does not exist", address))
        })?;
        let allowed = contract
            .allowed_signers(&call.function, &call.signers)
            .ok_or_else(|| {
                ValidationError::UnresolvableSigners(format!(
                    "function {} cannot be called by transaction",
                    call.function
                ))
            })?;
        if allowed.is_empty() {
            return Err(ValidationError::UnresolvableSigners(format!(
                "no declared signer may call {}",
                call.function
            )));
        }
        Ok(allowed)
    }

    pub fn check_signatures(&self, signed: &SignedTransaction, ledger: &dyn LedgerRead) -> Result<(), ValidationError> {
        let tx = &signed.transaction;
        if tx.code != tx.content_code() {
            return Err(ValidationError::CodeMismatch);
        }

        let mut required = self.required_signers(tx, ledger)?;
        required.dedup();
        let message = tx.canonical_bytes();

        for address in &required {
            let public_key = ledger
                .wallet(address)
                .and_then(|w| hex::decode(&w.wallet_public).ok())
                .ok_or_else(|| ValidationError::UnknownSigner(address.clone()))?;

            let mut candidates = signed
                .signatures
                .iter()
                .filter(|s| &s.wallet_address == address)
                .peekable();
            if candidates.peek().is_none() {
                return Err(ValidationError::MissingSignature(address.clone()));
            }
            let verified = candidates.any(|s| {
                hex::decode(&s.msgsign)
                    .map(|sig| self.crypto.verify(&sig, &message, &public_key))
                    .unwrap_or(false)
            });
            if !verified {
                return Err(ValidationError::InvalidSignature(address.clone()));
            }
        }
        Ok(())
    }

    pub fn check_economics(&self, tx: &Transaction, ledger: &dyn LedgerRead) -> Result<(), ValidationError> {
        if tx.pays_fee() {
            if tx.currency != NETWORK_TOKEN_CODE {
                return Err(ValidationError::FeeCurrency {
                    expected: NETWORK_TOKEN_CODE.to_string(),
                    got: tx.currency.clone(),
                });
            }
            if tx.fee < self.params.min_fee {
                return Err(ValidationError::FeeTooLow {
                    fee: tx.fee,
                    minimum: self.params.min_fee,
                });
            }
        }

        match &tx.kind {
            TransactionKind::WalletCreation(w) => self.check_wallet_creation(w, ledger),
            TransactionKind::TokenCreation(t) => self.check_token_creation(t, ledger),
            TransactionKind::TwoWayTransfer(t) => {
                let fee = if tx.pays_fee() { half_fee(tx.fee) } else { 0 };
                self.check_transfer(t, fee, true, ledger)
            }
            TransactionKind::OneWayTransfer(t) => {
                let fee = if tx.pays_fee() { tx.fee } else { 0 };
                self.check_transfer(t, fee, false, ledger)
            }
            TransactionKind::TrustScoreChange(c) => self.check_trust_change(c, ledger),
            TransactionKind::MinerAddition(m) => {
                if ledger.is_wallet_valid(&m.wallet_address, false) {
                    Ok(())
                } else {
                    Err(ValidationError::UnknownWallet(m.wallet_address.clone()))
                }
            }
            TransactionKind::SmartContract(call) => self.check_contract_call(call, ledger),
            TransactionKind::ScUpdate(_) => Ok(()),
        }
    }

    /// Static allow-list or custodian DAO membership
    pub fn is_custodian(&self, address: &str, ledger: &dyn LedgerRead) -> bool {
        if self.params.custodian_wallets.iter().any(|c| c == address) {
            return true;
        }
        let dao_pid = person_id_for_wallet(&self.params.custodian_dao_address);
        let member_pid = ledger
            .person_id(address)
            .map(str::to_string)
            .unwrap_or_else(|| person_id_for_wallet(address));
        ledger.is_dao_member(&dao_pid, &member_pid)
    }

    fn check_wallet_creation(&self, w: &WalletCreation, ledger: &dyn LedgerRead) -> Result<(), ValidationError> {
        if !self.is_custodian(&w.custodian_wallet, ledger) {
            return Err(ValidationError::UnauthorizedCustodian(w.custodian_wallet.clone()));
        }

        if w.attributes.linked_wallet {
            let parent = w.attributes.parent_address.as_deref();
            if parent != Some(w.custodian_wallet.as_str()) {
                return Err(ValidationError::LinkedWalletCustodian);
            }
            if ledger.person_id(&w.custodian_wallet).is_none() {
                return Err(ValidationError::MissingPersonId(w.custodian_wallet.clone()));
            }
        } else if ledger.wallet(&w.wallet_address).is_some() {
            return Err(ValidationError::WalletExists(w.wallet_address.clone()));
        }
        Ok(())
    }

    fn check_token_creation(&self, t: &TokenCreation, ledger: &dyn LedgerRead) -> Result<(), ValidationError> {
        if t.amount_created < 0 {
            return Err(ValidationError::NegativeAmount);
        }
        match &t.first_owner {
            Some(owner) if !ledger.is_wallet_valid(owner, true) => {
                return Err(ValidationError::UnknownWallet(owner.clone()));
            }
            None if t.amount_created != 0 => return Err(ValidationError::AmountWithoutOwner),
            _ => {}
        }
        if !ledger.is_wallet_valid(&t.custodian, true) {
            return Err(ValidationError::UnknownWallet(t.custodian.clone()));
        }

        if let Some(code) = t.requested_code() {
            if let Some(existing) = ledger.token(code) {
                if existing.custodian != t.custodian {
                    return Err(ValidationError::TokenCustodianMismatch(code.to_string()));
                }
                let overflow = || ValidationError::AmountOverflow {
                    wallet: t.custodian.clone(),
                    token: code.to_string(),
                };
                existing
                    .amount_created
                    .checked_add(t.amount_created)
                    .ok_or_else(overflow)?;
                if let Some(owner) = &t.first_owner {
                    ledger
                        .balance(owner, code)
                        .checked_add(t.amount_created)
                        .ok_or_else(overflow)?;
                }
            }
        }
        Ok(())
    }

    fn check_transfer(&self, t: &Transfer, fee_share: i64, two_way: bool, ledger: &dyn LedgerRead) -> Result<(), ValidationError> {
        if t.asset1_number < 0 || t.asset2_number < 0 {
            return Err(ValidationError::NegativeAmount);
        }

        if !ledger.is_wallet_valid(&t.wallet1, true) {
            return Err(ValidationError::UnknownWallet(t.wallet1.clone()));
        }
        let wallet2_ok = ledger.is_wallet_valid(&t.wallet2, true) || (!two_way && t.wallet2 == ZERO_ADDRESS);
        if !wallet2_ok {
            return Err(ValidationError::UnknownWallet(t.wallet2.clone()));
        }

        if ledger.token(&t.asset1_code).is_none() {
            return Err(ValidationError::UnknownToken(t.asset1_code.clone()));
        }
        if two_way && ledger.token(&t.asset2_code).is_none() {
            return Err(ValidationError::UnknownToken(t.asset2_code.clone()));
        }

        require_funds(
            ledger,
            &t.wallet1,
            &[(t.asset1_code.as_str(), t.asset1_number), (NETWORK_TOKEN_CODE, fee_share)],
        )?;
        if two_way {
            require_funds(
                ledger,
                &t.wallet2,
                &[(t.asset2_code.as_str(), t.asset2_number), (NETWORK_TOKEN_CODE, fee_share)],
            )?;
        }
        Ok(())
    }

    fn check_trust_change(&self, c: &TrustScoreChange, ledger: &dyn LedgerRead) -> Result<(), ValidationError> {
        for address in [&c.address1, &c.address2] {
            if !ledger.is_wallet_valid(address, true) {
                return Err(ValidationError::UnknownWallet(address.clone()));
            }
        }
        let pid1 = ledger
            .person_id(&c.address1)
            .ok_or_else(|| ValidationError::MissingPersonId(c.address1.clone()))?;
        let pid2 = ledger
            .person_id(&c.address2)
            .ok_or_else(|| ValidationError::MissingPersonId(c.address2.clone()))?;
        if pid1 == pid2 {
            return Err(ValidationError::SamePerson);
        }

        let bound = self.params.max_trust_score;
        if !(-bound..=bound).contains(&c.new_score) {
            return Err(ValidationError::ScoreOutOfRange(c.new_score));
        }
        Ok(())
    }

    fn check_contract_call(&self, call: &ContractCall, ledger: &dyn LedgerRead) -> Result<(), ValidationError> {
        for wallet in call.signers.iter().chain(call.params.participants.iter()) {
            if !ledger.is_wallet_valid(wallet, true) {
                return Err(ValidationError::UnknownWallet(wallet.clone()));
            }
        }

        if !call.params.value.is_empty() {
            let payer = call.signers.first().ok_or_else(|| {
                ValidationError::UnresolvableSigners("value transfer without a signer".into())
            })?;
            for value in &call.params.value {
                if ledger.token(&value.token_code).is_none() {
                    return Err(ValidationError::UnknownToken(value.token_code.clone()));
                }
                require_funds(ledger, payer, &[(value.token_code.as_str(), value.amount)])?;
            }
        }

        if call.is_setup() {
            let name = call.params.contract_name.as_deref().unwrap_or_default();
            if !self.contracts.contains(name) {
                return Err(ValidationError::Contract(format!("no execution module named {:?}", name)));
            }
            return Ok(());
        }

        let Some(contract) = call.address.as_deref().and_then(|a| ledger.contract(a)) else {
            return Err(ValidationError::Contract("call to an unknown contract".into()));
        };
        self.contracts
            .resolve(&contract.name)
            .and_then(|runtime| runtime.validate(call, ledger))
            .map_err(|e| ValidationError::Contract(e.to_string()))
    }
}

/// Check `wallet` holds every listed amount, summing amounts of the same token
fn require_funds(ledger: &dyn LedgerRead, wallet: &str, debits: &[(&str, i64)]) -> Result<(), ValidationError> {
    let mut needed: BTreeMap<&str, i64> = BTreeMap::new();
    for (token, amount) in debits {
        if *amount > 0 {
            let total = needed.entry(token).or_default();
            *total = total
                .checked_add(*amount)
                .ok_or_else(|| ValidationError::AmountOverflow {
                    wallet: wallet.to_string(),
                    token: token.to_string(),
                })?;
        }
    }
    for (token, needed) in needed {
        let available = ledger.balance(wallet, token);
        if needed > available {
            return Err(ValidationError::InsufficientBalance {
                wallet: wallet.to_string(),
                token: token.to_string(),
                needed,
                available,
            });
        }
    }
    Ok(())
}
