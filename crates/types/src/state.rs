//! Ledger rows
//!
//! One struct per table the Ledger Store owns. Nested collections (kyc docs,
//! staker breakdowns, signer policies) are typed here rather than stored as
//! encoded strings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::block::BlockStatus;

/// KYC document reference (type + content hash)
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct KycDoc {
    #[serde(rename = "type")]
    pub doc_type: i32,
    pub hash: String,
}

/// Wallet identity, immutable once created
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WalletRecord {
    /// Unique key; `0x` ordinary, `ct` contract-derived
    pub wallet_address: String,
    /// Hex encoded public key
    pub wallet_public: String,
    pub custodian_wallet: String,
    pub kyc_docs: Vec<KycDoc>,
    pub owner_type: i32,
    pub jurisdiction: i32,
    /// Free-form attributes supplied at creation
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Reputation subject grouping one or more wallets
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Person {
    pub person_id: String,
    pub created_time: i64,
}

/// Token definition
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TokenRecord {
    pub tokencode: String,
    pub token_name: String,
    pub token_type: String,
    pub first_owner: Option<String>,
    pub custodian: String,
    pub legal_doc_hash: String,
    /// Cumulative amount minted; only ever increases
    pub amount_created: i64,
    pub sc_flag: bool,
    pub disallowed: Vec<String>,
    /// Transaction that created the token
    pub parent_transaction_code: Option<String>,
    pub decimals: u32,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Latest score from one person towards another
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TrustScore {
    pub src_person_id: String,
    pub dest_person_id: String,
    pub score: i64,
    pub last_time: i64,
}

/// Registered miner
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MinerRecord {
    pub wallet_address: String,
    pub network_address: String,
    pub last_broadcast_timestamp: i64,
    pub block_index: u64,
}

/// One staker's contribution to a staked wallet
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StakerShare {
    pub staker_address: String,
    pub amount: i64,
}

/// Stake ledger entry: aggregate plus per-staker breakdown
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StakeEntry {
    pub wallet_address: String,
    pub amount: i64,
    pub stakers: Vec<StakerShare>,
}

/// Deployed smart contract
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContractRecord {
    /// `ct` prefixed address
    pub address: String,
    /// Selects the execution module in the contract registry
    pub name: String,
    pub creator: String,
    /// function -> allowed signers; `None` means anyone may call
    pub signatories: BTreeMap<String, Option<Vec<String>>>,
    /// Transaction that set the contract up
    pub parent: String,
}

impl ContractRecord {
    /// Resolve which of the declared signers may call `function`.
    ///
    /// Returns `None` when the function is not callable by transaction.
    pub fn allowed_signers(&self, function: &str, declared: &[String]) -> Option<Vec<String>> {
        let policy = self.signatories.get(function)?;
        let allowed = declared
            .iter()
            .filter(|signer| match policy {
                None => true,
                Some(list) if list.is_empty() => true,
                Some(list) => list.contains(signer),
            })
            .cloned()
            .collect();
        Some(allowed)
    }
}

/// Committed block as stored in the ledger
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    pub block_index: u64,
    pub hash: String,
    pub timestamp: i64,
    pub status: BlockStatus,
    pub proof: u64,
    pub previous_hash: String,
    pub creator_wallet: Option<String>,
    pub expected_miner: Option<String>,
    pub committee: Vec<String>,
    pub transaction_codes: Vec<String>,
}
