//! Confirmer: reconciles local state with the chain on every new head.
//!
//! Each head is processed to completion before the next one is read. Within
//! a head, every transaction goes through exactly one of:
//! 1. inclusion check (`broadcast`)
//! 2. reorg check, then finality check (`confirmed`)
//! 3. stuck-attempt escalation (`broadcast` and not included this head)

use super::gas::{FeeEstimator, GasPrice};
use super::signer::{build_transaction, TxSigner};
use crate::chain::finality::FinalityPolicy;
use crate::chain::{fetch_receipts, ChainClient, ChainError, Head, ReceiptInfo};
use crate::config::{ChainPolicy, FeeConfig};
use crate::error::TxmResult;
use crate::events::{EventBus, TxEvent};
use crate::state::{InFlight, NewAttempt, Receipt, Transaction, TxState, TxStore};

use dashmap::DashMap;
use ethers::types::H256;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Consecutive transient replacement failures tolerated for one transaction
pub const MAX_REPLACEMENT_FAILURES: u32 = 10;

/// Replacements the node refused for one stuck transaction
#[derive(Debug, Clone, Default)]
struct Rejections {
    /// Highest price refused as underpriced; the next bump starts from it
    underpriced: Option<GasPrice>,
    /// Underpriced refusals, counted against the bump depth
    underpriced_count: u32,
    transient_streak: u32,
    /// Head of the first nonce conflict
    nonce_conflict_since: Option<u64>,
}

pub struct Confirmer {
    chain_id: u64,
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    signer: Arc<dyn TxSigner>,
    fees: FeeEstimator,
    policy: ChainPolicy,
    finality: FinalityPolicy,
    events: EventBus,
    rejections: DashMap<Uuid, Rejections>,
}

impl Confirmer {
    pub fn new(
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        signer: Arc<dyn TxSigner>,
        fees: FeeConfig,
        policy: ChainPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            chain_id: policy.chain_id,
            store,
            client,
            signer,
            fees: FeeEstimator::new(fees),
            finality: FinalityPolicy::from_policy(&policy),
            policy,
            events,
            rejections: DashMap::new(),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut heads: mpsc::Receiver<Head>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "Confirmer started for chain {} ({:?} finality)",
            self.chain_id, self.finality
        );

        loop {
            let head = tokio::select! {
                _ = shutdown.changed() => break,
                head = heads.recv() => match head {
                    Some(head) => head,
                    None => break,
                },
            };

            if let Err(e) = self.process_head(head).await {
                warn!(
                    "Chain {}: reconciliation at head {} failed: {}",
                    self.chain_id, head.number, e
                );
            }
        }

        info!("Confirmer stopped for chain {}", self.chain_id);
    }

    /// Reconcile every in-flight transaction against `head`
    pub async fn process_head(&self, head: Head) -> TxmResult<()> {
        let (broadcast, confirmed): (Vec<InFlight>, Vec<InFlight>) = self
            .store
            .in_flight(self.chain_id)
            .await?
            .into_iter()
            .partition(|f| f.tx.state == TxState::Broadcast);

        debug!(
            "Chain {} head {}: {} broadcast, {} confirmed",
            self.chain_id,
            head.number,
            broadcast.len(),
            confirmed.len()
        );

        let stuck = self.check_inclusion(broadcast).await?;
        self.check_confirmed(&head, confirmed).await?;

        let still_stuck: HashSet<Uuid> = stuck.iter().map(|f| f.tx.id).collect();
        self.rejections.retain(|tx_id, _| still_stuck.contains(tx_id));

        for item in stuck {
            if let Err(e) = self.escalate(&head, &item).await {
                warn!(tx_id = %item.tx.id, "Escalation failed: {}", e);
            }
        }
        Ok(())
    }

    /// Confirm broadcast transactions with a receipt for any of their
    /// attempts; return the rest
    async fn check_inclusion(&self, broadcast: Vec<InFlight>) -> TxmResult<Vec<InFlight>> {
        if broadcast.is_empty() {
            return Ok(broadcast);
        }

        let hashes: Vec<H256> = broadcast
            .iter()
            .flat_map(|f| f.attempts.iter().map(|a| a.tx_hash))
            .collect();
        let receipts =
            fetch_receipts(self.client.as_ref(), &hashes, self.policy.rpc_batch_size).await?;

        let mut pending = Vec::new();
        for item in broadcast {
            let found = item
                .attempts
                .iter()
                .rev()
                .find_map(|a| receipts.get(&a.tx_hash).copied());
            match found {
                Some(receipt) => self.confirm(&item, receipt).await?,
                None => pending.push(item),
            }
        }
        Ok(pending)
    }

    async fn confirm(&self, item: &InFlight, receipt: ReceiptInfo) -> TxmResult<()> {
        let tx = &item.tx;
        if !receipt.success {
            warn!(
                tx_id = %tx.id,
                tx_hash = ?receipt.tx_hash,
                "Transaction included but reverted in block {}",
                receipt.block_number
            );
        }

        let confirmed = self
            .store
            .mark_confirmed(
                tx.id,
                Receipt {
                    tx_hash: receipt.tx_hash,
                    block_number: receipt.block_number,
                    block_hash: receipt.block_hash,
                    success: receipt.success,
                },
            )
            .await?;

        if confirmed {
            info!(
                chain_id = self.chain_id,
                tx_id = %tx.id,
                tx_hash = ?receipt.tx_hash,
                "Transaction confirmed in block {}",
                receipt.block_number
            );
            self.events.publish(TxEvent::Confirmed {
                chain_id: self.chain_id,
                tx_id: tx.id,
                tx_hash: receipt.tx_hash,
                block_number: receipt.block_number,
                success: receipt.success,
            });
        }
        Ok(())
    }

    /// Reorg check first; only transactions still canonical are considered
    /// for finality
    async fn check_confirmed(&self, head: &Head, confirmed: Vec<InFlight>) -> TxmResult<()> {
        if confirmed.is_empty() {
            return Ok(());
        }

        let finalized_through = match self
            .finality
            .finalized_through(head, self.client.as_ref())
            .await
        {
            Ok(block) => block,
            Err(e) => {
                warn!("Chain {}: finality lookup failed: {}", self.chain_id, e);
                None
            }
        };

        let mut canonical: HashMap<u64, Option<H256>> = HashMap::new();

        for item in confirmed {
            let tx = &item.tx;
            let Some(receipt) = tx.receipt.as_ref() else {
                continue;
            };

            let block_hash = match canonical.get(&receipt.block_number) {
                Some(hash) => *hash,
                None => {
                    let hash = self.client.block_hash(receipt.block_number).await?;
                    canonical.insert(receipt.block_number, hash);
                    hash
                }
            };

            if block_hash != Some(receipt.block_hash) {
                if self.store.revert_to_broadcast(tx.id).await? {
                    warn!(
                        chain_id = self.chain_id,
                        tx_id = %tx.id,
                        "Block {} left the canonical chain, transaction back to broadcast",
                        receipt.block_number
                    );
                    self.events.publish(TxEvent::ReorgDetected {
                        chain_id: self.chain_id,
                        tx_id: tx.id,
                        block_number: receipt.block_number,
                    });
                }
                continue;
            }

            let is_final = finalized_through.map_or(false, |f| receipt.block_number <= f);
            if is_final && self.store.mark_finalized(tx.id).await? {
                info!(
                    chain_id = self.chain_id,
                    tx_id = %tx.id,
                    "Transaction finalized at head {}",
                    head.number
                );
                self.events.publish(TxEvent::Finalized {
                    chain_id: self.chain_id,
                    tx_id: tx.id,
                    block_number: receipt.block_number,
                });
            }
        }
        Ok(())
    }

    /// Replace a stuck attempt with a higher-priced one carrying the same nonce
    async fn escalate(&self, head: &Head, item: &InFlight) -> TxmResult<()> {
        let config = self.fees.config();
        if config.bump_threshold == 0 {
            return Ok(());
        }

        let tx = &item.tx;
        let Some(active) = item.active_attempt() else {
            return Ok(());
        };
        let Some(since) = active.broadcast_block else {
            return self.store.set_broadcast_block(active.id, head.number).await;
        };
        if head.number.saturating_sub(since) < config.bump_threshold {
            return Ok(());
        }

        let rejected = self
            .rejections
            .get(&tx.id)
            .map(|r| r.value().clone())
            .unwrap_or_default();

        let escalations = item.escalations() + rejected.underpriced_count;
        if escalations >= config.bump_tx_depth {
            let reason = format!("bump depth reached after {} escalations", escalations);
            return self.fail(tx, &reason).await;
        }

        let from = rejected.underpriced.unwrap_or(active.gas_price);
        let gas_price = match self.fees.bump(tx.from, &from) {
            Ok(price) => price,
            Err(e) => return self.fail(tx, &e.to_string()).await,
        };

        let typed = build_transaction(tx, active.nonce, &gas_price, active.gas_limit);
        let signed = match self.signer.sign(&typed).await {
            Ok(signed) => signed,
            Err(e) => return self.fail(tx, &format!("signing failed: {}", e)).await,
        };

        match self.client.send_raw_transaction(signed.raw.clone()).await {
            Ok(()) | Err(ChainError::AlreadyKnown(_)) => {
                self.rejections.remove(&tx.id);
            }
            Err(ChainError::NonceTooLow(msg)) => {
                return self.nonce_conflict(head, item, &msg).await;
            }
            Err(ChainError::Underpriced(msg)) => {
                let mut entry = self.rejections.entry(tx.id).or_default();
                entry.underpriced = Some(gas_price);
                entry.underpriced_count += 1;
                entry.transient_streak = 0;
                info!(
                    tx_id = %tx.id,
                    "Replacement at {:?} underpriced ({}), next head bumps from it",
                    gas_price,
                    msg
                );
                return Ok(());
            }
            Err(ChainError::Transient(msg)) => {
                let streak = {
                    let mut entry = self.rejections.entry(tx.id).or_default();
                    entry.transient_streak += 1;
                    entry.transient_streak
                };
                if streak >= MAX_REPLACEMENT_FAILURES {
                    let reason = format!("replacement failed {} times in a row: {}", streak, msg);
                    return self.fail(tx, &reason).await;
                }
                warn!(tx_id = %tx.id, "Replacement will be retried next head: {}", msg);
                return Ok(());
            }
            Err(e @ ChainError::Fatal(_)) => return self.fail(tx, &e.to_string()).await,
        }

        let replaced = self
            .store
            .replace_attempt(
                tx.id,
                active.id,
                NewAttempt {
                    nonce: active.nonce,
                    gas_price,
                    gas_limit: active.gas_limit,
                    tx_hash: signed.hash,
                    signed_raw: signed.raw,
                    broadcast_block: Some(head.number),
                },
            )
            .await?;

        if replaced.is_some() {
            info!(
                chain_id = self.chain_id,
                tx_id = %tx.id,
                nonce = active.nonce,
                tx_hash = ?signed.hash,
                "Fee bumped from {:?} to {:?}",
                active.gas_price,
                gas_price
            );
            self.events.publish(TxEvent::FeeBumped {
                chain_id: self.chain_id,
                tx_id: tx.id,
                nonce: active.nonce,
                tx_hash: signed.hash,
                gas_price,
            });
        }
        Ok(())
    }

    /// The nonce is taken on chain. If one of our attempts holds it, its
    /// receipt turns up on a later head; once a finality window passes
    /// without one, another transaction consumed the nonce.
    async fn nonce_conflict(&self, head: &Head, item: &InFlight, msg: &str) -> TxmResult<()> {
        let tx = &item.tx;
        let since = *self
            .rejections
            .entry(tx.id)
            .or_default()
            .nonce_conflict_since
            .get_or_insert(head.number);

        let window = u64::from(self.policy.finality_depth.max(1));
        if head.number.saturating_sub(since) >= window {
            let nonce = item.active_attempt().map_or(0, |a| a.nonce);
            let reason = format!(
                "nonce {} consumed by another transaction ({} blocks without a receipt)",
                nonce,
                head.number - since
            );
            return self.fail(tx, &reason).await;
        }

        debug!(tx_id = %tx.id, "Replacement rejected: {}", msg);
        Ok(())
    }

    async fn fail(&self, tx: &Transaction, reason: &str) -> TxmResult<()> {
        self.rejections.remove(&tx.id);
        super::mark_fatal(self.store.as_ref(), &self.events, tx, reason).await?;
        Ok(())
    }
}
