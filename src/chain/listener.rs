//! Chain head feed
//!
//! Polls the chain head and forwards every new head, including same-height
//! replacements, to the confirmer.

use super::client::{ChainClient, Head};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Listens for new heads on a specific chain
pub struct HeadListener {
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    poll_interval: Duration,
    heads: mpsc::Sender<Head>,
}

impl HeadListener {
    pub fn new(
        client: Arc<dyn ChainClient>,
        poll_interval: Duration,
        heads: mpsc::Sender<Head>,
    ) -> Self {
        Self {
            chain_id: client.chain_id(),
            client,
            poll_interval,
            heads,
        }
    }

    /// Main polling loop; returns on shutdown or when the consumer is gone
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<Head> = None;

        info!("Head listener started for chain {}", self.chain_id);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let head = match self.client.head().await {
                Ok(head) => head,
                Err(e) => {
                    warn!("Failed to get head for chain {}: {}", self.chain_id, e);
                    crate::metrics::record_chain_health(self.chain_id, false);
                    continue;
                }
            };
            crate::metrics::record_chain_health(self.chain_id, true);

            if last == Some(head) {
                continue;
            }

            debug!(
                "Chain {}: new head {} {:?}",
                self.chain_id, head.number, head.hash
            );
            crate::metrics::record_head(self.chain_id, head.number);
            last = Some(head);

            if self.heads.send(head).await.is_err() {
                break;
            }
        }

        info!("Head listener stopped for chain {}", self.chain_id);
    }
}
