//! Blocks, receipts and the block payload envelope

use serde::{Deserialize, Serialize};

use crate::constants::{EMPTY_BLOCK_PROOF, SOFTWARE_VERSION};
use crate::crypto::{content_hash_hex, CryptoProvider, KeyPair};
use crate::state::BlockRecord;
use crate::transaction::SignedTransaction;

/// How a block came to be
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    #[default]
    Normal,
    /// Sentinel fallback: the expected miner produced nothing
    MiningTimeout,
    /// A proposal existed but the committee did not reach quorum
    ConsensusTimeout,
}

/// Block contents
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct BlockBody {
    pub transactions: Vec<SignedTransaction>,
    pub previous_block_receipts: Vec<Receipt>,
}

impl BlockBody {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.previous_block_receipts.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Block {
    pub index: u64,
    pub timestamp: i64,
    pub status: BlockStatus,
    pub proof: u64,
    pub previous_hash: String,
    pub creator_wallet: Option<String>,
    pub expected_miner: Option<String>,
    #[serde(default)]
    pub committee: Vec<String>,
    pub body: BlockBody,
}

impl Block {
    /// Hex digest of the canonical block bytes
    pub fn compute_hash(&self) -> String {
        content_hash_hex(&serde_json::to_vec(self).unwrap_or_default())
    }

    /// Empty fallback blocks carry the sentinel proof marker
    pub fn is_empty_fallback(&self) -> bool {
        self.proof == EMPTY_BLOCK_PROOF
    }

    pub fn transaction_codes(&self) -> Vec<String> {
        self.body
            .transactions
            .iter()
            .map(|tx| tx.transaction.code.clone())
            .collect()
    }

    /// Ledger row for this block once committed under `hash`
    pub fn to_record(&self, hash: &str) -> BlockRecord {
        BlockRecord {
            block_index: self.index,
            hash: hash.to_string(),
            timestamp: self.timestamp,
            status: self.status,
            proof: self.proof,
            previous_hash: self.previous_hash.clone(),
            creator_wallet: self.creator_wallet.clone(),
            expected_miner: self.expected_miner.clone(),
            committee: self.committee.clone(),
            transaction_codes: self.transaction_codes(),
        }
    }
}

/// A node's vote about a block
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(try_from = "i32", into = "i32")]
pub enum Vote {
    /// Committee member disagrees with the block
    Invalid,
    /// Committee member agrees with the block
    Valid,
    /// Cast by the block's own miner
    Miner,
}

impl TryFrom<i32> for Vote {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Vote::Invalid),
            1 => Ok(Vote::Valid),
            2 => Ok(Vote::Miner),
            other => Err(format!("unknown vote value {}", other)),
        }
    }
}

impl From<Vote> for i32 {
    fn from(vote: Vote) -> Self {
        match vote {
            Vote::Invalid => 0,
            Vote::Valid => 1,
            Vote::Miner => 2,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ReceiptData {
    pub vote: Vote,
    pub block_index: u64,
    pub block_hash: String,
}

/// Signed vote artifact
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    /// Hex public key of the voting node
    pub public_key: String,
    pub data: ReceiptData,
    /// Hex signature over the serialized `data`
    pub signature: String,
}

impl Receipt {
    /// Sign a vote for `block_hash` at `block_index`
    pub fn new<C: CryptoProvider + ?Sized>(
        crypto: &C,
        keys: &KeyPair,
        vote: Vote,
        block_index: u64,
        block_hash: &str,
    ) -> Self {
        let data = ReceiptData {
            vote,
            block_index,
            block_hash: block_hash.to_string(),
        };
        let message = serde_json::to_vec(&data).unwrap_or_default();
        Self {
            public_key: keys.public_hex(),
            signature: hex::encode(crypto.sign(&message, keys)),
            data,
        }
    }

    /// Check the signature against the embedded public key
    pub fn verify<C: CryptoProvider + ?Sized>(&self, crypto: &C) -> bool {
        let (Ok(public_key), Ok(signature)) = (hex::decode(&self.public_key), hex::decode(&self.signature)) else {
            return false;
        };
        let message = serde_json::to_vec(&self.data).unwrap_or_default();
        crypto.verify(&signature, &message, &public_key)
    }

    /// Stable identifier used to tell whether a receipt is already on-chain
    pub fn digest(&self) -> String {
        content_hash_hex(&serde_json::to_vec(self).unwrap_or_default())
    }
}

/// Block payload as broadcast and staged
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BlockPayload {
    pub index: u64,
    pub hash: String,
    pub data: Block,
    pub receipts: Vec<Receipt>,
    pub software_version: String,
}

impl BlockPayload {
    pub fn new(block: Block, receipts: Vec<Receipt>) -> Self {
        Self {
            index: block.index,
            hash: block.compute_hash(),
            data: block,
            receipts,
            software_version: SOFTWARE_VERSION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Provider;

    fn empty_block(index: u64) -> Block {
        Block {
            index,
            timestamp: 1_000,
            status: BlockStatus::Normal,
            proof: 0,
            previous_hash: "00".into(),
            creator_wallet: None,
            expected_miner: None,
            committee: vec![],
            body: BlockBody::default(),
        }
    }

    #[test]
    fn test_vote_wire_values() {
        assert_eq!(serde_json::to_string(&Vote::Miner).unwrap(), "2");
        assert_eq!(serde_json::from_str::<Vote>("1").unwrap(), Vote::Valid);
        assert!(serde_json::from_str::<Vote>("7").is_err());
    }

    #[test]
    fn test_receipt_signature() {
        let crypto = Ed25519Provider;
        let keys = KeyPair::generate();
        let mut receipt = Receipt::new(&crypto, &keys, Vote::Valid, 3, "abc");
        assert!(receipt.verify(&crypto));
        receipt.data.block_hash = "def".into();
        assert!(!receipt.verify(&crypto));
    }

    #[test]
    fn test_payload_hash_matches_block() {
        let block = empty_block(4);
        let payload = BlockPayload::new(block.clone(), vec![]);
        assert_eq!(payload.hash, block.compute_hash());
        assert_eq!(payload.index, 4);
        assert_eq!(payload.software_version, SOFTWARE_VERSION);
    }

    #[test]
    fn test_empty_fallback_marker() {
        let mut block = empty_block(1);
        assert!(!block.is_empty_fallback());
        block.proof = EMPTY_BLOCK_PROOF;
        assert!(block.is_empty_fallback());
    }
}
