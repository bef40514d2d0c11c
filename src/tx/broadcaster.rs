//! Broadcaster: turns `unstarted` transactions into signed, nonce-assigned,
//! fee-priced first attempts and submits them.
//!
//! Senders are processed concurrently; each sender's transactions strictly in
//! creation order. A retryable outcome ends that sender's cycle so a later
//! transaction can never take an earlier one's nonce.

use super::gas::{FeeEstimator, GasPrice};
use super::nonce::{NonceLease, NonceManager};
use super::signer::{build_transaction, SignedTx, TxSigner};
use crate::chain::{ChainClient, ChainError};
use crate::config::{ChainPolicy, FeeConfig};
use crate::error::TxmResult;
use crate::events::{EventBus, TxEvent};
use crate::state::{NewAttempt, Transaction, TxStore};

use dashmap::DashMap;
use ethers::types::Address;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Nonce conflicts tolerated for one transaction within one cycle
const MAX_NONCE_RESYNCS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Broadcast,
    Retry,
    Fatal,
}

pub struct Broadcaster {
    chain_id: u64,
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    signer: Arc<dyn TxSigner>,
    nonces: Arc<NonceManager>,
    fees: FeeEstimator,
    policy: ChainPolicy,
    events: EventBus,
    /// Fee to use on the next try after an underpriced rejection
    fee_hints: DashMap<Uuid, GasPrice>,
    /// Attempts the node accepted whose broadcast is not recorded yet
    unrecorded: DashMap<Uuid, NewAttempt>,
    wake: Notify,
}

impl Broadcaster {
    pub fn new(
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        signer: Arc<dyn TxSigner>,
        nonces: Arc<NonceManager>,
        fees: FeeConfig,
        policy: ChainPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            chain_id: policy.chain_id,
            store,
            client,
            signer,
            nonces,
            fees: FeeEstimator::new(fees),
            policy,
            events,
            fee_hints: DashMap::new(),
            unrecorded: DashMap::new(),
            wake: Notify::new(),
        }
    }

    /// Trigger a cycle without waiting for the next tick
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.policy.broadcast_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Broadcaster started for chain {}", self.chain_id);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            if let Err(e) = self.process_unstarted().await {
                warn!("Broadcast cycle failed for chain {}: {}", self.chain_id, e);
            }
        }

        info!("Broadcaster stopped for chain {}", self.chain_id);
    }

    /// One broadcast cycle over every sender with queued work
    pub async fn process_unstarted(&self) -> TxmResult<()> {
        let senders = self.store.unstarted_senders(self.chain_id).await?;
        if senders.is_empty() {
            return Ok(());
        }

        // Reference point for stuck detection; the confirmer falls back to the
        // first head it observes when this is unknown
        let head = match self.client.head().await {
            Ok(head) => Some(head.number),
            Err(e) => {
                debug!("Chain {}: head unavailable for broadcast cycle: {}", self.chain_id, e);
                None
            }
        };

        let results =
            join_all(senders.iter().map(|from| self.process_sender(*from, head))).await;
        for (from, result) in senders.iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(e) if e.should_alert() => {
                    error!(chain_id = self.chain_id, address = ?from, "Sender cycle aborted: {}", e)
                }
                Err(e) if e.is_retryable() => {
                    debug!(chain_id = self.chain_id, address = ?from, "Sender cycle deferred: {}", e)
                }
                Err(e) => {
                    warn!(chain_id = self.chain_id, address = ?from, "Sender cycle aborted: {}", e)
                }
            }
        }
        Ok(())
    }

    async fn process_sender(&self, from: Address, head: Option<u64>) -> TxmResult<()> {
        let queued = self
            .store
            .oldest_unstarted(self.chain_id, from, self.policy.rpc_batch_size)
            .await?;

        for tx in queued {
            if self.broadcast_one(&tx, head).await? == Outcome::Retry {
                break;
            }
        }
        Ok(())
    }

    async fn broadcast_one(&self, tx: &Transaction, head: Option<u64>) -> TxmResult<Outcome> {
        // Already on the chain with a consumed nonce; only the write is missing
        let pending = self.unrecorded.get(&tx.id).map(|a| a.value().clone());
        if let Some(attempt) = pending {
            return self.record(tx, attempt).await;
        }

        let mut lease = self.nonces.lease(tx.from).await?;
        let gas_price = self
            .fee_hints
            .get(&tx.id)
            .map(|hint| *hint)
            .unwrap_or_else(|| self.fees.initial(tx.from));
        let gas_limit = self.fees.gas_limit(tx.gas_limit);
        let mut resyncs = 0;

        loop {
            let typed = build_transaction(tx, lease.nonce(), &gas_price, gas_limit);
            let signed = match self.signer.sign(&typed).await {
                Ok(signed) => signed,
                Err(e) => {
                    let reason = format!("signing failed: {}", e);
                    return self.fail(tx, &reason).await;
                }
            };

            let error = match self.client.send_raw_transaction(signed.raw.clone()).await {
                Ok(()) => {
                    return self
                        .accept(tx, lease, gas_price, gas_limit, signed, head)
                        .await
                }
                Err(e) => e,
            };

            match error {
                ChainError::AlreadyKnown(_) => {
                    debug!(tx_id = %tx.id, "Attempt already known to the node");
                    return self
                        .accept(tx, lease, gas_price, gas_limit, signed, head)
                        .await;
                }
                ChainError::NonceTooLow(msg) => {
                    if resyncs == MAX_NONCE_RESYNCS {
                        warn!(
                            tx_id = %tx.id,
                            nonce = lease.nonce(),
                            "Nonce conflict persists after {} resyncs: {}",
                            resyncs,
                            msg
                        );
                        return Ok(Outcome::Retry);
                    }
                    resyncs += 1;
                    self.nonces.resync(&mut lease).await?;
                }
                ChainError::Underpriced(msg) => {
                    return match self.fees.bump(tx.from, &gas_price) {
                        Ok(next) => {
                            info!(
                                tx_id = %tx.id,
                                "Underpriced ({}), retrying at {:?}",
                                msg,
                                next
                            );
                            self.fee_hints.insert(tx.id, next);
                            Ok(Outcome::Retry)
                        }
                        Err(e) => self.fail(tx, &e.to_string()).await,
                    };
                }
                ChainError::Transient(msg) => {
                    warn!(
                        tx_id = %tx.id,
                        nonce = lease.nonce(),
                        "Broadcast will be retried: {}",
                        msg
                    );
                    return Ok(Outcome::Retry);
                }
                e @ ChainError::Fatal(_) => return self.fail(tx, &e.to_string()).await,
            }
        }
    }

    /// The node holds a transaction with the leased nonce from here on, so
    /// the nonce is consumed before the broadcast is written
    async fn accept(
        &self,
        tx: &Transaction,
        lease: NonceLease,
        gas_price: GasPrice,
        gas_limit: u64,
        signed: SignedTx,
        head: Option<u64>,
    ) -> TxmResult<Outcome> {
        let nonce = lease.nonce();
        if let Err(e) = self.nonces.commit(lease).await {
            warn!(tx_id = %tx.id, nonce, "Nonce cursor not persisted: {}", e);
        }
        self.fee_hints.remove(&tx.id);

        let attempt = NewAttempt {
            nonce,
            gas_price,
            gas_limit,
            tx_hash: signed.hash,
            signed_raw: signed.raw,
            broadcast_block: head,
        };
        self.unrecorded.insert(tx.id, attempt.clone());
        self.record(tx, attempt).await
    }

    /// Write an accepted attempt; on failure it stays queued and the next
    /// cycle retries the write without sending again
    async fn record(&self, tx: &Transaction, attempt: NewAttempt) -> TxmResult<Outcome> {
        let (nonce, tx_hash) = (attempt.nonce, attempt.tx_hash);
        let recorded = self.store.mark_broadcast(tx.id, attempt).await?;
        self.unrecorded.remove(&tx.id);

        if recorded.is_none() {
            warn!(tx_id = %tx.id, nonce, "Transaction left unstarted before broadcast was recorded");
            return Ok(Outcome::Broadcast);
        }

        info!(
            chain_id = self.chain_id,
            tx_id = %tx.id,
            nonce,
            tx_hash = ?tx_hash,
            "Transaction broadcast"
        );
        self.events.publish(TxEvent::Broadcast {
            chain_id: self.chain_id,
            tx_id: tx.id,
            nonce,
            tx_hash,
        });
        Ok(Outcome::Broadcast)
    }

    /// Fatal outcome; the leased nonce is released unconsumed
    async fn fail(&self, tx: &Transaction, reason: &str) -> TxmResult<Outcome> {
        self.fee_hints.remove(&tx.id);
        super::mark_fatal(self.store.as_ref(), &self.events, tx, reason).await?;
        Ok(Outcome::Fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TxState;
    use crate::testing::{dev_address, FlakyStore, Pipeline};
    use ethers::types::U256;

    fn broadcaster(p: &Pipeline) -> Broadcaster {
        Broadcaster::new(
            p.store.clone(),
            p.chain.clone(),
            p.signer.clone(),
            p.nonces.clone(),
            p.fees.clone(),
            p.policy.clone(),
            p.events.clone(),
        )
    }

    async fn attempt_of(p: &Pipeline, tx: &Transaction) -> crate::state::Attempt {
        let mut attempts = p.store.attempts(tx.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        attempts.remove(0)
    }

    #[tokio::test]
    async fn test_back_to_back_transactions_get_consecutive_nonces() {
        let p = Pipeline::new();
        p.chain.set_nonce(dev_address(), 7);
        let first = p.enqueue().await;
        let second = p.enqueue().await;
        let mut events = p.events.subscribe();

        broadcaster(&p).process_unstarted().await.unwrap();

        assert_eq!(p.reload(&first).await.state, TxState::Broadcast);
        assert_eq!(attempt_of(&p, &first).await.nonce, 7);
        assert_eq!(attempt_of(&p, &second).await.nonce, 8);
        assert_eq!(p.chain.sent().len(), 2);

        let event = events.recv().await.unwrap();
        assert_eq!(event.tx_id(), Some(first.id));
    }

    #[tokio::test]
    async fn test_first_attempt_uses_initial_price() {
        let p = Pipeline::new();
        let tx = p.enqueue().await;

        broadcaster(&p).process_unstarted().await.unwrap();

        let attempt = attempt_of(&p, &tx).await;
        assert_eq!(attempt.gas_price, GasPrice::Legacy(U256::from(10)));
        assert_eq!(attempt.gas_limit, 21_000);
        assert_eq!(p.chain.sent_hashes(), vec![attempt.tx_hash]);
    }

    #[tokio::test]
    async fn test_attempt_records_submission_head() {
        let p = Pipeline::new();
        p.chain.mine_to(7);
        let tx = p.enqueue().await;

        broadcaster(&p).process_unstarted().await.unwrap();

        assert_eq!(attempt_of(&p, &tx).await.broadcast_block, Some(7));
    }

    #[tokio::test]
    async fn test_unrecorded_broadcast_is_not_resent() {
        let p = Pipeline::new();
        let store = Arc::new(FlakyStore::new(p.store.clone()));
        store.fail_broadcasts(1);
        let b = Broadcaster::new(
            store,
            p.chain.clone(),
            p.signer.clone(),
            p.nonces.clone(),
            p.fees.clone(),
            p.policy.clone(),
            p.events.clone(),
        );
        let tx = p.enqueue().await;

        b.process_unstarted().await.unwrap();
        assert_eq!(p.reload(&tx).await.state, TxState::Unstarted);
        assert_eq!(p.chain.sent().len(), 1);

        // the payload is mined before the write is retried
        p.chain.set_nonce(dev_address(), 1);
        b.process_unstarted().await.unwrap();

        assert_eq!(p.reload(&tx).await.state, TxState::Broadcast);
        let attempt = attempt_of(&p, &tx).await;
        assert_eq!(attempt.nonce, 0);
        assert_eq!(p.chain.sent_hashes(), vec![attempt.tx_hash]);

        let next = p.enqueue().await;
        b.process_unstarted().await.unwrap();
        assert_eq!(attempt_of(&p, &next).await.nonce, 1);
        assert_eq!(p.chain.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_transient_error_keeps_order_and_nonce() {
        let p = Pipeline::new();
        let first = p.enqueue().await;
        let second = p.enqueue().await;
        p.chain
            .script_send([Err(ChainError::Transient("connection reset".into()))]);
        let b = broadcaster(&p);

        b.process_unstarted().await.unwrap();
        assert_eq!(p.reload(&first).await.state, TxState::Unstarted);
        assert_eq!(p.reload(&second).await.state, TxState::Unstarted);
        assert!(p.chain.sent().is_empty());

        b.process_unstarted().await.unwrap();
        assert_eq!(attempt_of(&p, &first).await.nonce, 0);
        assert_eq!(attempt_of(&p, &second).await.nonce, 1);
    }

    #[tokio::test]
    async fn test_nonce_conflict_resyncs_and_retries() {
        let p = Pipeline::new();
        let tx = p.enqueue().await;
        let b = broadcaster(&p);

        // cursor loads at 0, then the chain moves ahead
        p.nonces.lease(dev_address()).await.unwrap();
        p.chain.set_nonce(dev_address(), 5);
        p.chain
            .script_send([Err(ChainError::NonceTooLow("nonce too low".into()))]);

        b.process_unstarted().await.unwrap();

        assert_eq!(p.reload(&tx).await.state, TxState::Broadcast);
        assert_eq!(attempt_of(&p, &tx).await.nonce, 5);
    }

    #[tokio::test]
    async fn test_fatal_rejection_does_not_consume_nonce() {
        let p = Pipeline::new();
        let doomed = p.enqueue().await;
        let next = p.enqueue().await;
        p.chain.script_send([Err(ChainError::Fatal(
            "insufficient funds for gas * price + value".into(),
        ))]);

        broadcaster(&p).process_unstarted().await.unwrap();

        let doomed = p.reload(&doomed).await;
        assert_eq!(doomed.state, TxState::Fatal);
        assert!(doomed.fatal_reason.unwrap().contains("insufficient funds"));
        assert_eq!(attempt_of(&p, &next).await.nonce, 0);
    }

    #[tokio::test]
    async fn test_underpriced_retries_with_bumped_fee() {
        let p = Pipeline::new();
        let tx = p.enqueue().await;
        p.chain
            .script_send([Err(ChainError::Underpriced("transaction underpriced".into()))]);
        let b = broadcaster(&p);

        b.process_unstarted().await.unwrap();
        assert_eq!(p.reload(&tx).await.state, TxState::Unstarted);

        b.process_unstarted().await.unwrap();
        let attempt = attempt_of(&p, &tx).await;
        assert_eq!(attempt.gas_price, GasPrice::Legacy(U256::from(12)));
        assert_eq!(attempt.nonce, 0);
    }

    #[tokio::test]
    async fn test_underpriced_at_ceiling_is_fatal() {
        let mut p = Pipeline::new();
        p.fees.price_default_wei = 50;
        let tx = p.enqueue().await;
        p.chain
            .script_send([Err(ChainError::Underpriced("transaction underpriced".into()))]);

        broadcaster(&p).process_unstarted().await.unwrap();

        let tx = p.reload(&tx).await;
        assert_eq!(tx.state, TxState::Fatal);
        assert!(tx.fatal_reason.unwrap().contains("fee ceiling reached"));
    }

    #[tokio::test]
    async fn test_already_known_counts_as_accepted() {
        let p = Pipeline::new();
        let tx = p.enqueue().await;
        p.chain
            .script_send([Err(ChainError::AlreadyKnown("already known".into()))]);

        broadcaster(&p).process_unstarted().await.unwrap();

        assert_eq!(p.reload(&tx).await.state, TxState::Broadcast);
        assert_eq!(p.nonces.lease(dev_address()).await.unwrap().nonce(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_wakes_on_notify_and_stops() {
        let p = Pipeline::new();
        let mut policy = p.policy.clone();
        policy.broadcast_interval = std::time::Duration::from_secs(3600);
        let b = Arc::new(Broadcaster::new(
            p.store.clone(),
            p.chain.clone(),
            p.signer.clone(),
            p.nonces.clone(),
            p.fees.clone(),
            policy,
            p.events.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut events = p.events.subscribe();
        let handle = tokio::spawn(b.clone().run(shutdown_rx));

        let tx = p.enqueue().await;
        b.notify();
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.tx_id(), Some(tx.id));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
