//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Per-sender nonce cursors, serialized per address
//! - Cold-start and drift resynchronization against the chain
//! - Persistence so restarts never reuse a nonce

use crate::chain::ChainClient;
use crate::error::{TxmError, TxmResult};
use crate::state::{NonceCursor, TxStore};

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Per-address cursor; `None` until synchronized
#[derive(Debug, Default)]
struct AddressNonce {
    next: Option<u64>,
}

/// Exclusive hold on a sender's next nonce.
///
/// Dropping the lease consumes nothing; only [`NonceManager::commit`]
/// advances the cursor.
pub struct NonceLease {
    address: Address,
    nonce: u64,
    guard: OwnedMutexGuard<AddressNonce>,
}

impl NonceLease {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }
}

/// Manages nonces for every sender of one chain
pub struct NonceManager {
    chain_id: u64,
    auto_sync: bool,
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    cursors: DashMap<Address, Arc<Mutex<AddressNonce>>>,
}

impl NonceManager {
    /// Create a new nonce manager
    pub fn new(
        chain_id: u64,
        auto_sync: bool,
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
    ) -> Self {
        Self {
            chain_id,
            auto_sync,
            store,
            client,
            cursors: DashMap::new(),
        }
    }

    /// Lock the sender's cursor and read its next nonce, loading it on first use
    pub async fn lease(&self, address: Address) -> TxmResult<NonceLease> {
        let slot = self.cursors.entry(address).or_default().clone();
        let mut guard = slot.lock_owned().await;

        let nonce = match guard.next {
            Some(next) => next,
            None => {
                let next = self.load(address).await?;
                guard.next = Some(next);
                next
            }
        };

        Ok(NonceLease {
            address,
            nonce,
            guard,
        })
    }

    /// Re-derive the lease's nonce from the chain after a nonce conflict
    pub async fn resync(&self, lease: &mut NonceLease) -> TxmResult<u64> {
        let previous = lease.nonce;
        lease.guard.next = None;

        let next = self.sync_with_chain(lease.address).await?;
        lease.guard.next = Some(next);
        lease.nonce = next;

        warn!(
            chain_id = self.chain_id,
            address = ?lease.address,
            "Nonce resynced from {} to {}",
            previous,
            next
        );
        Ok(next)
    }

    /// Consume the leased nonce and persist the advanced cursor
    pub async fn commit(&self, mut lease: NonceLease) -> TxmResult<u64> {
        let next = lease.nonce + 1;
        lease.guard.next = Some(next);

        self.store
            .save_nonce_cursor(NonceCursor {
                chain_id: self.chain_id,
                address: lease.address,
                next_nonce: next,
            })
            .await?;

        debug!(
            chain_id = self.chain_id,
            address = ?lease.address,
            "Consumed nonce {}",
            lease.nonce
        );
        Ok(lease.nonce)
    }

    /// Cold-start load of a sender's cursor
    async fn load(&self, address: Address) -> TxmResult<u64> {
        if self.auto_sync {
            return self.sync_with_chain(address).await;
        }

        let local = self.local_next(address).await?;
        let persisted = self
            .store
            .load_nonce_cursor(self.chain_id, address)
            .await?
            .map(|c| c.next_nonce);

        let next = match (persisted, local) {
            (None, None) => self.chain_nonce(address).await?,
            (persisted, local) => persisted.unwrap_or(0).max(local.unwrap_or(0)),
        };

        info!(
            chain_id = self.chain_id,
            address = ?address,
            "Loaded nonce cursor {}",
            next
        );
        Ok(next)
    }

    /// max(chain's next nonce, highest non-fatal local nonce + 1)
    async fn sync_with_chain(&self, address: Address) -> TxmResult<u64> {
        let on_chain = self.chain_nonce(address).await?;
        let local = self.local_next(address).await?;
        let next = on_chain.max(local.unwrap_or(0));

        if let Some(local) = local {
            if local != on_chain {
                debug!(
                    chain_id = self.chain_id,
                    address = ?address,
                    "Nonce drift: chain {} local {}",
                    on_chain,
                    local
                );
            }
        }

        self.store
            .save_nonce_cursor(NonceCursor {
                chain_id: self.chain_id,
                address,
                next_nonce: next,
            })
            .await?;

        info!(
            chain_id = self.chain_id,
            address = ?address,
            "Synced nonce cursor to {}",
            next
        );
        Ok(next)
    }

    async fn local_next(&self, address: Address) -> TxmResult<Option<u64>> {
        Ok(self
            .store
            .max_assigned_nonce(self.chain_id, address)
            .await?
            .map(|n| n + 1))
    }

    async fn chain_nonce(&self, address: Address) -> TxmResult<u64> {
        self.client
            .pending_nonce(address)
            .await
            .map_err(|e| TxmError::Nonce {
                chain_id: self.chain_id,
                message: e.to_string(),
            })
    }
}
