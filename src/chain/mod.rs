//! Chain module - chain boundary and multi-chain pipeline ownership
//!
//! This module provides:
//! - The `ChainClient` boundary with classified errors
//! - Multi-RPC provider management with automatic failover
//! - Head polling and chain-specific finality policy
//! - One independent transaction pipeline per configured chain

mod client;
pub mod finality;
pub mod listener;
mod provider;

pub use client::{fetch_receipts, ChainClient, ChainError, Head, ReceiptInfo};
#[cfg(test)]
pub use client::MockChainClient;
pub use provider::ChainProvider;

use crate::config::Settings;
use crate::error::{TxmError, TxmResult};
use crate::state::TxStore;
use crate::tx::TxSigner;
use crate::txm::TxManager;

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Owns the transaction manager of every enabled chain
pub struct ChainManager {
    managers: DashMap<u64, Arc<TxManager>>,
}

impl ChainManager {
    /// Build a pipeline for every enabled chain
    pub fn new(
        settings: &Settings,
        store: Arc<dyn TxStore>,
        signer: Arc<dyn TxSigner>,
    ) -> TxmResult<Self> {
        let mut managers = Vec::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {}, type: {}, l2: {})",
                name,
                chain_config.chain_id,
                chain_config.chain_type.as_str(),
                chain_config.chain_type.is_l2()
            );
            if chain_config.chain_type.is_l2()
                && !chain_config.finality_tag_enabled
                && chain_config.finality_depth.is_none()
            {
                warn!(
                    "Chain {} is a rollup without finality tag or explicit depth; using default depth",
                    name
                );
            }

            let provider = Arc::new(ChainProvider::new(chain_config)?);
            managers.push(Arc::new(TxManager::new(
                chain_config,
                store.clone(),
                provider,
                signer.clone(),
                settings.database.default_query_timeout(),
            )));
        }

        Ok(Self::from_managers(managers))
    }

    pub fn from_managers(managers: impl IntoIterator<Item = Arc<TxManager>>) -> Self {
        let map = DashMap::new();
        for manager in managers {
            map.insert(manager.chain_id(), manager);
        }
        Self { managers: map }
    }

    /// Get the manager of a specific chain
    pub fn get(&self, chain_id: u64) -> TxmResult<Arc<TxManager>> {
        self.managers
            .get(&chain_id)
            .map(|m| m.clone())
            .ok_or(TxmError::ChainNotFound { chain_id })
    }

    /// Get all configured chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.managers.iter().map(|e| *e.key()).collect();
        chains.sort_unstable();
        chains
    }

    fn all(&self) -> Vec<Arc<TxManager>> {
        self.managers.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn start(&self) -> TxmResult<()> {
        for manager in self.all() {
            manager.start().await?;
        }
        Ok(())
    }

    pub async fn stop(&self) {
        futures::future::join_all(self.all().iter().map(|m| m.stop())).await;
        info!("Chain manager stopped");
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let managers = self.all();
        let checks = futures::future::join_all(managers.iter().map(|m| m.health_check())).await;

        let mut results: Vec<(u64, bool)> = managers
            .iter()
            .zip(checks)
            .map(|(manager, check)| {
                let chain_id = manager.chain_id();
                if let Err(e) = &check {
                    warn!("Chain {} health check failed: {}", chain_id, e);
                }
                crate::metrics::record_chain_health(chain_id, check.is_ok());
                (chain_id, check.is_ok())
            })
            .collect();
        results.sort_unstable();
        results
    }
}
