//! Transactions
//!
//! A transaction is a tagged union over the enumerated kinds, each with its
//! own typed payload. The content code is computed once at creation from the
//! canonical body and is never recomputed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::NETWORK_TOKEN_CODE;
use crate::crypto::{content_hash_hex, CryptoProvider, KeyPair};
use crate::state::KycDoc;

/// Attributes of a wallet-creation request
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct WalletAttributes {
    /// Linked wallets join the parent's person instead of minting a new one
    #[serde(default)]
    pub linked_wallet: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_address: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WalletCreation {
    pub custodian_wallet: String,
    pub wallet_address: String,
    /// Hex encoded public key
    pub wallet_public: String,
    #[serde(default)]
    pub kyc_docs: Vec<KycDoc>,
    #[serde(default)]
    pub owner_type: i32,
    #[serde(default)]
    pub jurisdiction: i32,
    #[serde(default)]
    pub attributes: WalletAttributes,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TokenCreation {
    /// Existing code to mint more of, or a requested code for a new token.
    /// Absent, `""`, `"0"` and `"string"` all request a generated code.
    #[serde(default)]
    pub tokencode: Option<String>,
    pub token_name: String,
    pub token_type: String,
    #[serde(default)]
    pub first_owner: Option<String>,
    pub custodian: String,
    #[serde(default)]
    pub legal_doc_hash: String,
    pub amount_created: i64,
    #[serde(default)]
    pub disallowed: Vec<String>,
    #[serde(default)]
    pub decimals: u32,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub sc_flag: bool,
}

impl TokenCreation {
    /// The user supplied code, if it names a specific token
    pub fn requested_code(&self) -> Option<&str> {
        match self.tokencode.as_deref() {
            None | Some("") | Some("0") | Some("string") => None,
            Some(code) => Some(code),
        }
    }
}

/// Payload shared by one-way and two-way transfers
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub wallet1: String,
    pub wallet2: String,
    pub asset1_code: String,
    #[serde(default)]
    pub asset2_code: String,
    pub asset1_number: i64,
    #[serde(default)]
    pub asset2_number: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TrustScoreChange {
    pub address1: String,
    pub address2: String,
    pub new_score: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MinerAddition {
    pub wallet_address: String,
    pub network_address: String,
    pub broadcast_timestamp: i64,
    #[serde(default)]
    pub software_version: String,
    #[serde(default)]
    pub last_block_index: u64,
}

/// Declared value movement attached to a contract call
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ValueTransfer {
    pub token_code: String,
    pub amount: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ContractParams {
    /// Proposed creator, required for `setup`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    /// Execution module name, required for `setup`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<ValueTransfer>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContractCall {
    #[serde(default)]
    pub address: Option<String>,
    pub function: String,
    #[serde(default)]
    pub signers: Vec<String>,
    #[serde(default)]
    pub params: ContractParams,
}

impl ContractCall {
    pub fn is_setup(&self) -> bool {
        self.function == "setup"
    }
}

/// Transaction kinds
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", content = "specific_data", rename_all = "snake_case")]
pub enum TransactionKind {
    WalletCreation(WalletCreation),
    TokenCreation(TokenCreation),
    SmartContract(ContractCall),
    TwoWayTransfer(Transfer),
    OneWayTransfer(Transfer),
    TrustScoreChange(TrustScoreChange),
    MinerAddition(MinerAddition),
    ScUpdate(ContractCall),
}

impl TransactionKind {
    /// Numeric type as used by the network
    pub fn type_code(&self) -> u8 {
        match self {
            TransactionKind::WalletCreation(_) => 1,
            TransactionKind::TokenCreation(_) => 2,
            TransactionKind::SmartContract(_) => 3,
            TransactionKind::TwoWayTransfer(_) => 4,
            TransactionKind::OneWayTransfer(_) => 5,
            TransactionKind::TrustScoreChange(_) => 6,
            TransactionKind::MinerAddition(_) => 7,
            TransactionKind::ScUpdate(_) => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransactionKind::WalletCreation(_) => "wallet_creation",
            TransactionKind::TokenCreation(_) => "token_creation",
            TransactionKind::SmartContract(_) => "smart_contract",
            TransactionKind::TwoWayTransfer(_) => "two_way_transfer",
            TransactionKind::OneWayTransfer(_) => "one_way_transfer",
            TransactionKind::TrustScoreChange(_) => "trust_score_change",
            TransactionKind::MinerAddition(_) => "miner_addition",
            TransactionKind::ScUpdate(_) => "sc_update",
        }
    }
}

/// Transaction body
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Transaction {
    pub timestamp: i64,
    /// Content code, hash of the canonical body with this field blank
    pub code: String,
    pub currency: String,
    pub fee: i64,
    #[serde(default)]
    pub description: Option<String>,
    /// Child transactions are emitted by contracts and pay no fee
    #[serde(default)]
    pub is_child_txn: bool,
    #[serde(flatten)]
    pub kind: TransactionKind,
}

impl Transaction {
    /// Build a transaction paying `fee` in the network token and compute its code
    pub fn new(kind: TransactionKind, fee: i64, timestamp: i64) -> Self {
        let mut tx = Self {
            timestamp,
            code: String::new(),
            currency: NETWORK_TOKEN_CODE.to_string(),
            fee,
            description: None,
            is_child_txn: false,
            kind,
        };
        tx.code = tx.content_code();
        tx
    }

    /// Canonical bytes: what signatures cover
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Plain structs, string keys and BTreeMaps: serialization cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Hash of the body with the code blanked out
    pub fn content_code(&self) -> String {
        let mut body = self.clone();
        body.code = String::new();
        content_hash_hex(&body.canonical_bytes())
    }

    pub fn type_code(&self) -> u8 {
        self.kind.type_code()
    }

    /// Whether the economic check demands a network-token fee
    pub fn pays_fee(&self) -> bool {
        !(self.is_child_txn
            || matches!(
                self.kind,
                TransactionKind::MinerAddition(_) | TransactionKind::ScUpdate(_)
            ))
    }
}

/// One signer's signature over the canonical body
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxSignature {
    pub wallet_address: String,
    /// Hex encoded signature bytes
    pub msgsign: String,
}

/// Transaction envelope
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    #[serde(default)]
    pub signatures: Vec<TxSignature>,
}

impl SignedTransaction {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            signatures: Vec::new(),
        }
    }

    pub fn code(&self) -> &str {
        &self.transaction.code
    }

    /// Append a signature by `address` made with `keys`
    pub fn sign<C: CryptoProvider + ?Sized>(&mut self, crypto: &C, keys: &KeyPair, address: &str) {
        let signature = crypto.sign(&self.transaction.canonical_bytes(), keys);
        self.signatures.push(TxSignature {
            wallet_address: address.to_string(),
            msgsign: hex::encode(signature),
        });
    }

    /// Builder-style variant of [`SignedTransaction::sign`]
    pub fn signed_by<C: CryptoProvider + ?Sized>(mut self, crypto: &C, keys: &KeyPair, address: &str) -> Self {
        self.sign(crypto, keys, address);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Provider;

    fn transfer() -> TransactionKind {
        TransactionKind::OneWayTransfer(Transfer {
            wallet1: "0xaa".into(),
            wallet2: "0xbb".into(),
            asset1_code: "NWRL".into(),
            asset2_code: String::new(),
            asset1_number: 10,
            asset2_number: 0,
        })
    }

    #[test]
    fn test_code_is_stable_and_content_derived() {
        let a = Transaction::new(transfer(), 1, 1000);
        let b = Transaction::new(transfer(), 1, 1000);
        let c = Transaction::new(transfer(), 1, 1001);
        assert_eq!(a.code, b.code);
        assert_ne!(a.code, c.code);
        assert_eq!(a.code, a.content_code());
    }

    #[test]
    fn test_wire_shape_uses_kind_tag() {
        let tx = Transaction::new(transfer(), 1, 1000);
        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["kind"], "one_way_transfer");
        assert_eq!(value["specific_data"]["wallet1"], "0xaa");

        let back: Transaction = serde_json::from_value(value).unwrap();
        assert_eq!(back, tx);
        assert_eq!(back.type_code(), 5);
    }

    #[test]
    fn test_malformed_payload_is_rejected_at_parse() {
        let raw = serde_json::json!({
            "timestamp": 1, "code": "x", "currency": "NWRL", "fee": 1,
            "kind": "trust_score_change",
            "specific_data": { "address1": "0xaa" }
        });
        assert!(serde_json::from_value::<Transaction>(raw).is_err());
    }

    #[test]
    fn test_requested_token_code_placeholders() {
        let mut token = TokenCreation {
            tokencode: Some("0".into()),
            token_name: "t".into(),
            token_type: "1".into(),
            first_owner: None,
            custodian: "0xaa".into(),
            legal_doc_hash: String::new(),
            amount_created: 0,
            disallowed: vec![],
            decimals: 0,
            attributes: BTreeMap::new(),
            sc_flag: false,
        };
        assert_eq!(token.requested_code(), None);
        token.tokencode = Some("GOLD".into());
        assert_eq!(token.requested_code(), Some("GOLD"));
    }

    #[test]
    fn test_signature_covers_canonical_body() {
        let crypto = Ed25519Provider;
        let keys = KeyPair::generate();
        let signed = SignedTransaction::new(Transaction::new(transfer(), 1, 5)).signed_by(&crypto, &keys, "0xaa");
        let sig = hex::decode(&signed.signatures[0].msgsign).unwrap();
        assert!(crypto.verify(&sig, &signed.transaction.canonical_bytes(), &keys.public_bytes()));
    }
}
