//! Known EVM networks and their x402 v1 names.

use alloy_primitives::{Address, address};

/// A numeric EIP-155 chain id.
pub type ChainId = u64;

/// Base Mainnet chain ID.
pub const BASE_MAINNET: ChainId = 8453;

/// Base Sepolia (testnet) chain ID.
pub const BASE_SEPOLIA: ChainId = 84532;

/// Polygon Mainnet chain ID.
pub const POLYGON_MAINNET: ChainId = 137;

/// Polygon Amoy (testnet) chain ID.
pub const POLYGON_AMOY: ChainId = 80002;

/// Avalanche C-Chain chain ID.
pub const AVALANCHE_MAINNET: ChainId = 43114;

/// Avalanche Fuji (testnet) chain ID.
pub const AVALANCHE_FUJI: ChainId = 43113;

/// Ethereum Mainnet chain ID.
pub const ETHEREUM_MAINNET: ChainId = 1;

/// Celo Mainnet chain ID.
pub const CELO_MAINNET: ChainId = 42220;

/// Default EIP-712 domain name for USDC.
pub const DEFAULT_USDC_NAME: &str = "USD Coin";

/// Default EIP-712 domain version for USDC.
pub const DEFAULT_USDC_VERSION: &str = "2";

/// A network addressable by its x402 v1 name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownNetwork {
    /// The v1 network name (e.g. `"base-sepolia"`).
    pub name: &'static str,
    /// The EIP-155 chain id.
    pub chain_id: ChainId,
    /// The USDC deployment on this network.
    pub usdc: Address,
}

/// Networks this crate can sign for.
pub const KNOWN_NETWORKS: &[KnownNetwork] = &[
    KnownNetwork {
        name: "base",
        chain_id: BASE_MAINNET,
        usdc: address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
    },
    KnownNetwork {
        name: "base-sepolia",
        chain_id: BASE_SEPOLIA,
        usdc: address!("036CbD53842c5426634e7929541eC2318f3dCF7e"),
    },
    KnownNetwork {
        name: "ethereum",
        chain_id: ETHEREUM_MAINNET,
        usdc: address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
    },
    KnownNetwork {
        name: "polygon",
        chain_id: POLYGON_MAINNET,
        usdc: address!("3c499c542cEF5E3811e1192ce70d8cC03d5c3359"),
    },
    KnownNetwork {
        name: "polygon-amoy",
        chain_id: POLYGON_AMOY,
        usdc: address!("41E94Eb71Ef8C9fAE0235d1e472b21E21B5a4dbF"),
    },
    KnownNetwork {
        name: "avalanche",
        chain_id: AVALANCHE_MAINNET,
        usdc: address!("B97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E"),
    },
    KnownNetwork {
        name: "avalanche-fuji",
        chain_id: AVALANCHE_FUJI,
        usdc: address!("5425890298aed601595a70AB815c96711a31Bc65"),
    },
    KnownNetwork {
        name: "celo",
        chain_id: CELO_MAINNET,
        usdc: address!("cebA9300f2b948710d2653dD7B07f33A8B32118C"),
    },
];

/// Looks up a network by its v1 name.
#[must_use]
pub fn network_by_name(name: &str) -> Option<&'static KnownNetwork> {
    KNOWN_NETWORKS.iter().find(|n| n.name == name)
}

/// Returns the chain id for a v1 network name.
#[must_use]
pub fn chain_id_for(name: &str) -> Option<ChainId> {
    network_by_name(name).map(|n| n.chain_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(chain_id_for("base-sepolia"), Some(84532));
        assert_eq!(chain_id_for("polygon-amoy"), Some(80002));
        assert_eq!(chain_id_for("solana"), None);
    }
}
