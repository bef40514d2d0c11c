//! Chain provider with multi-RPC support and automatic failover

use super::client::{ChainClient, ChainError, Head, ReceiptInfo};
use crate::config::ChainConfig;
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::{Address, BlockNumber, Bytes, H256, U64};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    chain_id: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Bound on every RPC call
    rpc_timeout: Duration,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: &ChainConfig) -> TxmResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(TxmError::Config(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        Ok(Self {
            chain_id: config.chain_id,
            http_providers,
            current_provider: AtomicUsize::new(0),
            rpc_timeout: config.rpc_timeout(),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    /// Run a call with a timeout, failing over on transient errors
    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, ChainError>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = ChainError::Transient(format!("{}: no providers", operation));

        for _ in 0..self.http_providers.len() {
            match timeout(self.rpc_timeout, f(self.http().clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    let error = ChainError::classify(&e.to_string());
                    if !matches!(error, ChainError::Transient(_)) {
                        return Err(error);
                    }
                    warn!("Chain {} {} failed: {}", self.chain_id, operation, e);
                    last_error = error;
                }
                Err(_) => {
                    warn!("Chain {} {} timed out", self.chain_id, operation);
                    last_error =
                        ChainError::Transient(format!("{} timed out after {:?}", operation, self.rpc_timeout));
                }
            }
            self.failover();
        }

        Err(last_error)
    }
}

#[async_trait]
impl ChainClient for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<(), ChainError> {
        let tx_hash = self
            .call("send_raw_transaction", |provider| {
                let raw = raw.clone();
                async move {
                    provider
                        .send_raw_transaction(raw)
                        .await
                        .map(|pending| pending.tx_hash())
                }
            })
            .await?;

        debug!("Chain {} accepted transaction {:?}", self.chain_id, tx_hash);
        Ok(())
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<ReceiptInfo>, ChainError> {
        let receipt = self
            .call("get_transaction_receipt", |provider| async move {
                provider.get_transaction_receipt(hash).await
            })
            .await?;

        Ok(receipt.and_then(|r| {
            Some(ReceiptInfo {
                tx_hash: r.transaction_hash,
                block_number: r.block_number?.as_u64(),
                block_hash: r.block_hash?,
                success: r.status == Some(U64::one()),
            })
        }))
    }

    async fn head(&self) -> Result<Head, ChainError> {
        let block = self
            .call("get_block(latest)", |provider| async move {
                provider.get_block(BlockNumber::Latest).await
            })
            .await?
            .ok_or_else(|| ChainError::Transient("no latest block".to_string()))?;

        match (block.number, block.hash) {
            (Some(number), Some(hash)) => Ok(Head {
                number: number.as_u64(),
                hash,
            }),
            _ => Err(ChainError::Transient("latest block is pending".to_string())),
        }
    }

    async fn block_hash(&self, number: u64) -> Result<Option<H256>, ChainError> {
        let block = self
            .call("get_block(number)", |provider| async move {
                provider.get_block(BlockNumber::Number(number.into())).await
            })
            .await?;

        Ok(block.and_then(|b| b.hash))
    }

    async fn finalized_block_number(&self) -> Result<u64, ChainError> {
        let block = self
            .call("get_block(finalized)", |provider| async move {
                provider.get_block(BlockNumber::Finalized).await
            })
            .await?;

        block
            .and_then(|b| b.number)
            .map(|n| n.as_u64())
            .ok_or_else(|| ChainError::Transient("no finalized block".to_string()))
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, ChainError> {
        let nonce = self
            .call("get_transaction_count", |provider| async move {
                provider
                    .get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;

        Ok(nonce.as_u64())
    }
}
