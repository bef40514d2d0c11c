//! Transaction pipeline: fees, nonces, signing and the background components
//! that drive a transaction from `unstarted` to a terminal state

mod broadcaster;
mod confirmer;
mod gas;
mod nonce;
mod reaper;
mod resender;
mod signer;

pub use broadcaster::Broadcaster;
pub use confirmer::Confirmer;
pub use gas::{FeeError, FeeEstimator, GasPrice};
pub use nonce::{NonceLease, NonceManager};
pub use reaper::Reaper;
pub use resender::Resender;
pub use signer::{build_transaction, LocalKeySigner, SignedTx, TxSigner};

use crate::error::TxmResult;
use crate::events::{EventBus, TxEvent};
use crate::state::{Transaction, TxStore};

use tracing::error;

/// Move a transaction to `fatal` and announce it; a no-op if it already left
/// the non-terminal states
pub(crate) async fn mark_fatal(
    store: &dyn TxStore,
    events: &EventBus,
    tx: &Transaction,
    reason: &str,
) -> TxmResult<bool> {
    if !store.mark_fatal(tx.id, reason).await? {
        return Ok(false);
    }

    error!(
        chain_id = tx.chain_id,
        tx_id = %tx.id,
        nonce = ?tx.nonce,
        "Transaction fatal: {}",
        reason
    );
    events.publish(TxEvent::Fatal {
        chain_id: tx.chain_id,
        tx_id: tx.id,
        reason: reason.to_string(),
    });
    Ok(true)
}
