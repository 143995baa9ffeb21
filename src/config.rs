// src/config.rs
use std::path::PathBuf;
use std::time::Duration;

use ethers::types::{Address, U256};

/// Kite testnet chain id.
pub const DEFAULT_CHAIN_ID: u64 = 2368;

/// ERC-4337 v0.6 EntryPoint.
pub const DEFAULT_ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

pub const DEFAULT_TOKEN_ADDRESS: &str = "0x2eed6D0736B5cF79F8C4964353dbe1640069Cff4";

pub const DEFAULT_RPC_URL: &str = "https://rpc-testnet.gokite.ai";

pub const DEFAULT_BUNDLER_URL: &str = "https://bundler-service.staging.gokite.ai/rpc/";

/// Everything the account client needs to build, sign and submit operations
/// for a single smart account.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub rpc_url: String,
    pub bundler_url: String,
    pub entry_point: Address,
    /// The smart account (proxy) that acts as `sender`.
    pub account: Address,
    pub chain_id: u64,
}

impl SdkConfig {
    pub fn new(account: Address) -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            bundler_url: DEFAULT_BUNDLER_URL.to_string(),
            entry_point: default_address(DEFAULT_ENTRY_POINT),
            account,
            chain_id: DEFAULT_CHAIN_ID,
        }
    }
}

/// Token metadata, including the EIP-712 domain the token verifies against.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub eip712_name: String,
    pub eip712_version: String,
    pub decimals: u8,
    pub minimum_transfer_amount: U256,
    pub balance_threshold: U256,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            address: default_address(DEFAULT_TOKEN_ADDRESS),
            name: "Kite Agent Token".to_string(),
            symbol: "KAT".to_string(),
            eip712_name: "Kite Agent Token".to_string(),
            eip712_version: "1".to_string(),
            decimals: 18,
            // 0.01 token at 18 decimals
            minimum_transfer_amount: U256::from(10_000_000_000_000_000u64),
            balance_threshold: U256::zero(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub token: TokenConfig,
    pub history_path: PathBuf,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            chain_id: DEFAULT_CHAIN_ID,
            token: TokenConfig::default(),
            history_path: PathBuf::from("transfer-limits.json"),
        }
    }
}

/// Fixed-interval receipt polling. No backoff, no jitter.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(60_000),
            interval: Duration::from_millis(2_000),
        }
    }
}

fn default_address(s: &str) -> Address {
    s.parse().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let config = SdkConfig::new(Address::zero());
        assert_ne!(config.entry_point, Address::zero());
        assert_eq!(config.chain_id, 2368);

        let token = TokenConfig::default();
        assert_ne!(token.address, Address::zero());
        assert_eq!(token.decimals, 18);

        let poll = PollConfig::default();
        assert_eq!(poll.timeout, Duration::from_secs(60));
        assert_eq!(poll.interval, Duration::from_secs(2));
    }
}
