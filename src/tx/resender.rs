//! Resender: periodically resubmits the active attempt of every `broadcast`
//! transaction with identical signed bytes, to survive silent mempool eviction

use crate::chain::{ChainClient, ChainError};
use crate::config::ListenerConfig;
use crate::error::TxmResult;
use crate::state::{TxState, TxStore};

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct Resender {
    chain_id: u64,
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    poll_interval: Duration,
    batch_size: usize,
}

impl Resender {
    pub fn new(
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        listener: &ListenerConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            chain_id: client.chain_id(),
            store,
            client,
            poll_interval: listener.fallback_poll_interval(),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; nothing has been evicted yet
        ticker.tick().await;

        info!("Resender started for chain {}", self.chain_id);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.resend_all().await {
                warn!("Resend cycle failed for chain {}: {}", self.chain_id, e);
            }
        }

        info!("Resender stopped for chain {}", self.chain_id);
    }

    /// Resubmit every active attempt once; returns how many the chain accepted
    pub async fn resend_all(&self) -> TxmResult<usize> {
        let raws: Vec<_> = self
            .store
            .in_flight(self.chain_id)
            .await?
            .into_iter()
            .filter(|f| f.tx.state == TxState::Broadcast)
            .filter_map(|f| f.active_attempt().map(|a| (f.tx.id, a.signed_raw.clone())))
            .collect();

        if raws.is_empty() {
            return Ok(0);
        }

        let mut accepted = 0;
        for chunk in raws.chunks(self.batch_size) {
            let results = join_all(
                chunk
                    .iter()
                    .map(|(_, raw)| self.client.send_raw_transaction(raw.clone())),
            )
            .await;

            for ((tx_id, _), result) in chunk.iter().zip(results) {
                match result {
                    Ok(()) => accepted += 1,
                    Err(ChainError::AlreadyKnown(_)) | Err(ChainError::NonceTooLow(_)) => {}
                    Err(e) => debug!(tx_id = %tx_id, "Resend rejected: {}", e),
                }
            }
        }

        crate::metrics::record_resend(self.chain_id, raws.len());
        debug!(
            "Chain {}: resent {} attempts, {} accepted",
            self.chain_id,
            raws.len(),
            accepted
        );
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::state::{MemoryTxStore, NewAttempt, NewTransaction, TxRequest};
    use crate::testing::Pipeline;
    use crate::tx::{Broadcaster, GasPrice};
    use ethers::types::{Address, Bytes, H256, U256};

    fn listener_config(ms: u64) -> ListenerConfig {
        ListenerConfig {
            fallback_poll_interval_ms: ms,
            head_poll_interval_ms: ms,
        }
    }

    #[tokio::test]
    async fn test_resends_identical_bytes_each_interval() {
        let p = Pipeline::new();
        let tx = p.enqueue().await;
        Broadcaster::new(
            p.store.clone(),
            p.chain.clone(),
            p.signer.clone(),
            p.nonces.clone(),
            p.fees.clone(),
            p.policy.clone(),
            p.events.clone(),
        )
        .process_unstarted()
        .await
        .unwrap();
        let original = p.store.attempts(tx.id).await.unwrap()[0].signed_raw.clone();

        let resender = Resender::new(p.store.clone(), p.chain.clone(), &listener_config(10), 10);
        assert_eq!(resender.resend_all().await.unwrap(), 1);
        assert_eq!(resender.resend_all().await.unwrap(), 1);

        let sent = p.chain.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|raw| *raw == original));

        // once confirmed it is no longer resent
        p.chain.include(p.chain.sent_hashes()[0], 0);
        let head = p.chain.head().await.unwrap();
        crate::tx::Confirmer::new(
            p.store.clone(),
            p.chain.clone(),
            p.signer.clone(),
            p.fees.clone(),
            p.policy.clone(),
            p.events.clone(),
        )
        .process_head(head)
        .await
        .unwrap();
        assert_eq!(resender.resend_all().await.unwrap(), 0);
        assert_eq!(p.chain.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_expected_rejections_are_ignored() {
        let store = Arc::new(MemoryTxStore::new());
        for _ in 0..3 {
            let tx = store
                .insert_transaction(NewTransaction {
                    chain_id: 1,
                    request: TxRequest {
                        from: Address::repeat_byte(1),
                        to: Address::zero(),
                        value: U256::zero(),
                        data: Bytes::default(),
                        gas_limit: None,
                    },
                })
                .await
                .unwrap();
            store
                .mark_broadcast(
                    tx.id,
                    NewAttempt {
                        nonce: 0,
                        gas_price: GasPrice::Legacy(U256::one()),
                        gas_limit: 21_000,
                        tx_hash: H256::random(),
                        signed_raw: Bytes::from(vec![1, 2, 3]),
                        broadcast_block: None,
                    },
                )
                .await
                .unwrap();
        }

        let mut client = MockChainClient::new();
        client.expect_chain_id().return_const(1u64);
        let mut calls = 0;
        client
            .expect_send_raw_transaction()
            .times(3)
            .returning(move |_| {
                calls += 1;
                match calls {
                    1 => Err(ChainError::AlreadyKnown("already known".into())),
                    2 => Err(ChainError::NonceTooLow("nonce too low".into())),
                    _ => Ok(()),
                }
            });

        let resender = Resender::new(store, Arc::new(client), &listener_config(10), 2);
        assert_eq!(resender.resend_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let p = Pipeline::new();
        let resender = Arc::new(Resender::new(
            p.store.clone(),
            p.chain.clone(),
            &listener_config(5),
            10,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(resender.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
