//! Reaper: deletes terminal transactions past the retention window, in
//! bounded batches within a per-sweep time budget

use crate::config::ReaperConfig;
use crate::error::{TxmError, TxmResult};
use crate::events::{EventBus, TxEvent};
use crate::state::TxStore;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct Reaper {
    chain_id: u64,
    store: Arc<dyn TxStore>,
    config: ReaperConfig,
    query_timeout: Duration,
    events: EventBus,
}

impl Reaper {
    pub fn new(
        chain_id: u64,
        store: Arc<dyn TxStore>,
        config: ReaperConfig,
        query_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            chain_id,
            store,
            config,
            query_timeout,
            events,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.reap_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Reaper started for chain {}", self.chain_id);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.sweep().await {
                warn!("Reap sweep failed for chain {}: {}", self.chain_id, e);
            }
        }

        info!("Reaper stopped for chain {}", self.chain_id);
    }

    /// One retention sweep; returns the number of deleted transactions
    pub async fn sweep(&self) -> TxmResult<u64> {
        let retention = chrono::Duration::from_std(self.config.reap_threshold())
            .map_err(|e| TxmError::Config(format!("Invalid reap threshold: {}", e)))?;
        let cutoff = Utc::now() - retention;
        let batch_size = self.config.batch_size.max(1) as usize;
        let deadline = Instant::now() + self.config.reap_interval();

        let mut total = 0;
        loop {
            let deleted = timeout(
                self.query_timeout,
                self.store.reap(self.chain_id, cutoff, batch_size),
            )
            .await
            .map_err(|_| TxmError::Timeout {
                operation: format!("reap batch on chain {}", self.chain_id),
            })??;
            total += deleted;

            if deleted < batch_size as u64 {
                break;
            }
            if Instant::now() >= deadline {
                debug!("Chain {}: reap budget spent, resuming next sweep", self.chain_id);
                break;
            }
        }

        if total > 0 {
            info!("Chain {}: reaped {} terminal transactions", self.chain_id, total);
            self.events.publish(TxEvent::Reaped {
                chain_id: self.chain_id,
                count: total,
            });
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TxState;
    use crate::testing::Pipeline;

    fn reaper_config(threshold_secs: u64, batch_size: u32) -> ReaperConfig {
        ReaperConfig {
            reap_interval_ms: 60_000,
            reap_threshold_secs: threshold_secs,
            batch_size,
        }
    }

    #[tokio::test]
    async fn test_reaps_only_terminal_transactions_in_batches() {
        let p = Pipeline::new();
        let mut terminal = Vec::new();
        for i in 0..5 {
            let tx = p.enqueue().await;
            let reason = format!("rejected {}", i);
            assert!(p.store.mark_fatal(tx.id, &reason).await.unwrap());
            terminal.push(tx);
        }
        let live = p.enqueue().await;
        let mut events = p.events.subscribe();

        // zero retention: everything terminal is already expired
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reaper = Reaper::new(
            1,
            p.store.clone(),
            reaper_config(0, 2),
            Duration::from_secs(1),
            p.events.clone(),
        );
        assert_eq!(reaper.sweep().await.unwrap(), 5);

        for tx in &terminal {
            assert!(p.store.get_transaction(tx.id).await.unwrap().is_none());
        }
        assert_eq!(p.reload(&live).await.state, TxState::Unstarted);
        assert!(matches!(
            events.recv().await.unwrap(),
            TxEvent::Reaped { count: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_retention_window_is_respected() {
        let p = Pipeline::new();
        let tx = p.enqueue().await;
        p.store.mark_fatal(tx.id, "rejected").await.unwrap();

        let reaper = Reaper::new(
            1,
            p.store.clone(),
            reaper_config(3_600, 10),
            Duration::from_secs(1),
            p.events.clone(),
        );
        assert_eq!(reaper.sweep().await.unwrap(), 0);
        assert!(p.store.get_transaction(tx.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_other_chains_untouched() {
        let p = Pipeline::new();
        let tx = p.enqueue().await;
        p.store.mark_fatal(tx.id, "rejected").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reaper = Reaper::new(
            2,
            p.store.clone(),
            reaper_config(0, 10),
            Duration::from_secs(1),
            p.events.clone(),
        );
        assert_eq!(reaper.sweep().await.unwrap(), 0);
        assert!(p.store.get_transaction(tx.id).await.unwrap().is_some());
    }
}
