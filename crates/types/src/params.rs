//! Chain parameters
//!
//! Resolved once at startup from the selected network and handed to every
//! component; nothing reads network constants ambiently.

use serde::{Deserialize, Serialize};

use crate::constants::{
    INITIAL_NETWORK_TRUST_SCORE, MAX_BLOCK_SIZE, MAX_NETWORK_TRUST_SCORE, STARTING_REWARD,
};

/// Which network the node joins
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Devnet,
    Testnet,
    Mainnet,
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "devnet" => Ok(Network::Devnet),
            "testnet" => Ok(Network::Testnet),
            "mainnet" => Ok(Network::Mainnet),
            other => Err(format!("unknown network {}", other)),
        }
    }
}

const DEVNET_OPERATOR: &str = "0x667663f36ac08e78bbf259f1361f02dc7dad593b";
const DEVNET_TRUST_MANAGER_PID: &str = "pi10d84aa634ba8751804ca4e02134696a75ae3515";
const NETWORK_TREASURY_ADDRESS: &str = "ctb020e608d11c235724e676d021a08f8da6c64eb8";
const STAKE_CT_ADDRESS: &str = "ctcdb91798f3022dee388b7ad55eeea527f98caee4";
const CUSTODIAN_DAO_ADDRESS: &str = "ctb020e608d11c235724e676d021a08f8da6c64ec3";
const NETWORK_TOKEN_DECIMALS: u32 = 6;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ChainParams {
    pub network: Network,

    // Timing
    /// Target time between blocks
    pub block_interval_ms: i64,
    /// Period of the global scheduler tick
    pub global_tick_ms: i64,
    /// Extra wait past the slot before a committee member emits an empty-block receipt
    pub no_block_timeout_ms: i64,
    /// Minimum spacing between stall-triggered resyncs
    pub min_sync_interval_ms: i64,
    /// Miner registrations older than this are stale
    pub miner_broadcast_interval_ms: i64,
    /// Mempool entries older than this are dropped by housekeeping
    pub mempool_max_age_ms: i64,

    // Committee
    pub committee_size: usize,
    pub minimum_acceptance_votes: usize,
    pub max_block_size: usize,

    // Economics
    /// Minimum fee, in base units of the network token
    pub min_fee: i64,
    pub starting_reward: i64,

    // Trust
    pub initial_trust_score: i64,
    pub max_trust_score: i64,

    // Staking
    pub min_stake_amount: i64,
    pub stake_penalty_ratio: i64,
    pub stake_contract_address: String,
    pub network_treasury_address: String,

    // Well-known wallets
    pub treasury_wallet_address: String,
    pub network_trust_manager_wallet: String,
    pub network_trust_manager_pid: String,
    pub sentinel_node_wallet: String,
    pub custodian_dao_address: String,
    /// Static custodian allow-list
    pub custodian_wallets: Vec<String>,
}

impl ChainParams {
    pub fn for_network(network: Network) -> Self {
        let token_multiplier = 10i64.pow(NETWORK_TOKEN_DECIMALS);
        let base = Self {
            network,
            block_interval_ms: 30_000,
            global_tick_ms: 5_000,
            no_block_timeout_ms: 10_000,
            min_sync_interval_ms: 60_000,
            miner_broadcast_interval_ms: 600_000,
            mempool_max_age_ms: 24 * 60 * 60 * 1000,
            committee_size: 10,
            minimum_acceptance_votes: 6,
            max_block_size: MAX_BLOCK_SIZE,
            min_fee: token_multiplier,
            starting_reward: STARTING_REWARD,
            initial_trust_score: INITIAL_NETWORK_TRUST_SCORE,
            max_trust_score: MAX_NETWORK_TRUST_SCORE,
            min_stake_amount: 100_000 * token_multiplier,
            stake_penalty_ratio: 10,
            stake_contract_address: STAKE_CT_ADDRESS.to_string(),
            network_treasury_address: NETWORK_TREASURY_ADDRESS.to_string(),
            treasury_wallet_address: DEVNET_OPERATOR.to_string(),
            network_trust_manager_wallet: DEVNET_OPERATOR.to_string(),
            network_trust_manager_pid: DEVNET_TRUST_MANAGER_PID.to_string(),
            sentinel_node_wallet: DEVNET_OPERATOR.to_string(),
            custodian_dao_address: CUSTODIAN_DAO_ADDRESS.to_string(),
            custodian_wallets: vec![DEVNET_OPERATOR.to_string()],
        };

        match network {
            Network::Devnet | Network::Testnet => base,
            Network::Mainnet => Self {
                min_stake_amount: 100_000,
                treasury_wallet_address: "0x5d5e00b81bf2018d4db56b6ff6bf67bd77889450".to_string(),
                network_trust_manager_wallet: "0xaecdbe3d58a2b9e20445210678ac5e7ebf8b6172".to_string(),
                network_trust_manager_pid: "pi69e3fc1a079b3b6b4d23958ef9941c3ed8431b7d".to_string(),
                sentinel_node_wallet: "0x02245e77732cd9fa4068eca57d0fc1767b02becb".to_string(),
                custodian_wallets: vec!["0x5d5e00b81bf2018d4db56b6ff6bf67bd77889450".to_string()],
                ..base
            },
        }
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::for_network(Network::Devnet)
    }
}
