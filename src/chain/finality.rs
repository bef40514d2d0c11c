//! Chain finality policy
//!
//! A chain either exposes an explicit `finalized` block tag or is treated as
//! final after a fixed confirmation depth. The two are never combined.

use super::client::{ChainClient, ChainError, Head};
use crate::config::ChainPolicy;

/// How a chain decides that an included block is irreversible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalityPolicy {
    /// Blocks at or behind the chain-reported finalized block
    Tag,
    /// Blocks at least this many blocks behind the head
    Depth(u32),
}

impl FinalityPolicy {
    pub fn from_policy(policy: &ChainPolicy) -> Self {
        if policy.finality_tag_enabled {
            FinalityPolicy::Tag
        } else {
            FinalityPolicy::Depth(policy.finality_depth)
        }
    }

    /// Highest block number considered final at `head`
    pub async fn finalized_through(
        &self,
        head: &Head,
        client: &dyn ChainClient,
    ) -> Result<Option<u64>, ChainError> {
        match self {
            FinalityPolicy::Tag => client.finalized_block_number().await.map(Some),
            FinalityPolicy::Depth(depth) => Ok(head.number.checked_sub(*depth as u64)),
        }
    }
}

/// Recommended finality depth for a chain
pub fn recommended_finality_depth(chain_id: u64) -> u32 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 17000 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 64,
    }
}
