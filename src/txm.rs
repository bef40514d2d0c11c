//! Per-chain transaction manager
//!
//! Owns one chain's pipeline: head listener, broadcaster, confirmer,
//! resender and reaper, all sharing the chain's store view, client, signer
//! and event bus. Chains never share nonce cursors or tasks.

use crate::chain::listener::HeadListener;
use crate::chain::{ChainClient, Head};
use crate::config::ChainConfig;
use crate::error::{TxmError, TxmResult};
use crate::events::{EventBus, TxEvent};
use crate::state::{
    Attempt, NewTransaction, Transaction, TransactionStats, TxRequest, TxState, TxStore,
};
use crate::tx::{Broadcaster, Confirmer, NonceManager, Reaper, Resender, TxSigner};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;
const HEAD_CHANNEL_CAPACITY: usize = 64;

pub struct TxManager {
    chain_id: u64,
    name: String,
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    signer: Arc<dyn TxSigner>,
    events: EventBus,
    broadcaster: Arc<Broadcaster>,
    confirmer: Arc<Confirmer>,
    resender: Arc<Resender>,
    reaper: Arc<Reaper>,
    head_poll_interval: Duration,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TxManager {
    pub fn new(
        config: &ChainConfig,
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        signer: Arc<dyn TxSigner>,
        query_timeout: Duration,
    ) -> Self {
        let policy = config.policy();
        let events = EventBus::new(EVENT_CAPACITY);

        let nonces = Arc::new(NonceManager::new(
            config.chain_id,
            policy.nonce_auto_sync,
            store.clone(),
            client.clone(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            store.clone(),
            client.clone(),
            signer.clone(),
            nonces,
            config.fees.clone(),
            policy.clone(),
            events.clone(),
        ));
        let confirmer = Arc::new(Confirmer::new(
            store.clone(),
            client.clone(),
            signer.clone(),
            config.fees.clone(),
            policy.clone(),
            events.clone(),
        ));
        let resender = Arc::new(Resender::new(
            store.clone(),
            client.clone(),
            &config.listener,
            policy.rpc_batch_size,
        ));
        let reaper = Arc::new(Reaper::new(
            config.chain_id,
            store.clone(),
            config.reaper.clone(),
            query_timeout,
            events.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            chain_id: config.chain_id,
            name: config.name.clone(),
            store,
            client,
            signer,
            events,
            broadcaster,
            confirmer,
            resender,
            reaper,
            head_poll_interval: config.listener.head_poll_interval(),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accept a transaction request; delivery continues asynchronously
    pub async fn enqueue(&self, request: TxRequest) -> TxmResult<Transaction> {
        if !self.signer.has_key(request.from) {
            return Err(TxmError::UnknownSender {
                chain_id: self.chain_id,
                address: format!("{:?}", request.from),
            });
        }

        let tx = self
            .store
            .insert_transaction(NewTransaction {
                chain_id: self.chain_id,
                request,
            })
            .await?;

        info!(
            chain_id = self.chain_id,
            tx_id = %tx.id,
            from = ?tx.from,
            "Transaction enqueued"
        );
        crate::metrics::record_enqueued(self.chain_id);
        self.broadcaster.notify();
        Ok(tx)
    }

    /// A transaction with its attempt history
    pub async fn transaction(&self, tx_id: Uuid) -> TxmResult<(Transaction, Vec<Attempt>)> {
        let tx = self
            .store
            .get_transaction(tx_id)
            .await?
            .filter(|tx| tx.chain_id == self.chain_id)
            .ok_or_else(|| TxmError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            })?;
        let attempts = self.store.attempts(tx_id).await?;
        Ok((tx, attempts))
    }

    /// Transactions of this chain, oldest first, optionally filtered by state
    pub async fn list(&self, state: Option<TxState>, limit: usize) -> TxmResult<Vec<Transaction>> {
        self.store.list_transactions(self.chain_id, state, limit).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TxEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> TxmResult<TransactionStats> {
        self.store.stats(self.chain_id).await
    }

    /// Current chain head; fails when the chain is unreachable
    pub async fn health_check(&self) -> TxmResult<Head> {
        Ok(self.client.head().await?)
    }

    /// Spawn the pipeline tasks
    pub async fn start(&self) -> TxmResult<()> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Ok(());
        }
        if *self.shutdown.borrow() {
            return Err(TxmError::InvalidStateTransition {
                from: "stopped".to_string(),
                to: "running".to_string(),
            });
        }

        let (head_tx, head_rx) = mpsc::channel(HEAD_CHANNEL_CAPACITY);
        let listener = HeadListener::new(self.client.clone(), self.head_poll_interval, head_tx);

        handles.push(tokio::spawn(listener.run(self.shutdown.subscribe())));
        handles.push(tokio::spawn(
            self.confirmer.clone().run(head_rx, self.shutdown.subscribe()),
        ));
        handles.push(tokio::spawn(
            self.broadcaster.clone().run(self.shutdown.subscribe()),
        ));
        handles.push(tokio::spawn(
            self.resender.clone().run(self.shutdown.subscribe()),
        ));
        handles.push(tokio::spawn(
            self.reaper.clone().run(self.shutdown.subscribe()),
        ));

        info!("Chain {} ({}) pipeline started", self.name, self.chain_id);
        Ok(())
    }

    /// Signal every task to stop and wait for them to exit
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Chain {} task ended abnormally: {}", self.chain_id, e);
            }
        }

        info!("Chain {} ({}) pipeline stopped", self.name, self.chain_id);
    }
}
