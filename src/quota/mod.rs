//! Pre-flight credit checks for generation requests.
//!
//! [`QuotaGate`] charges a fixed cost before each request and hands it back
//! when the request fails for a reason other than quota itself.  Checks and
//! charges for one user are serialized so two concurrent requests cannot
//! both spend the same last credit.

pub mod sqlite;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{GenQueueError, Result};

pub use sqlite::SqliteLedger;

/// Reason recorded on the ledger when a failed generation is refunded.
pub const REFUND_REASON: &str = "generation failed, credits returned";

/// Reason recorded when a dispatch is cancelled after its credits were taken.
pub const CANCEL_REASON: &str = "dispatch cancelled, credits returned";

const DEBIT_REASON: &str = "generation";

/// Persistent per-user credit balance.
///
/// Implementations must apply `try_debit` atomically: the balance check and
/// the decrement happen in one store transaction.
#[async_trait::async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn balance(&self, actor: &str) -> Result<i64>;

    /// Take `amount` credits if the balance covers it.  Returns the new
    /// balance, or `None` (and changes nothing) when it does not.
    async fn try_debit(&self, actor: &str, amount: i64, reason: &str) -> Result<Option<i64>>;

    /// Add `amount` credits and return the new balance.
    async fn credit(&self, actor: &str, amount: i64, reason: &str) -> Result<i64>;

    /// Most recent ledger rows for `actor`, newest first.
    async fn entries(&self, actor: &str, limit: usize) -> Result<Vec<LedgerEntry>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: String,
    pub delta: i64,
    pub balance_after: i64,
    pub reason: String,
    pub created_at: String,
}

/// Proof that credits were taken for one request.  Pass it back to
/// [`QuotaGate::refund`] if the request fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub actor: String,
    pub amount: i64,
    pub balance_after: i64,
}

pub struct QuotaGate {
    ledger: Arc<dyn QuotaLedger>,
    cost: i64,
    /// One async lock per user; the outer lock only guards the map.
    actor_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl QuotaGate {
    pub fn new(ledger: Arc<dyn QuotaLedger>, cost: i64) -> Self {
        Self {
            ledger,
            cost,
            actor_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn QuotaLedger> {
        &self.ledger
    }

    fn lock_for(&self, actor: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .actor_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(actor.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Charge the per-request cost.  Fails closed with
    /// [`GenQueueError::InsufficientBalance`] and no charge when the balance
    /// is short.
    pub async fn authorize(&self, actor: &str) -> Result<Authorization> {
        let lock = self.lock_for(actor);
        let _guard = lock.lock().await;

        match self.ledger.try_debit(actor, self.cost, DEBIT_REASON).await? {
            Some(balance_after) => {
                debug!(actor, cost = self.cost, balance_after, "credits authorized");
                Ok(Authorization {
                    actor: actor.to_string(),
                    amount: self.cost,
                    balance_after,
                })
            }
            None => {
                let balance = self.ledger.balance(actor).await?;
                info!(actor, balance, required = self.cost, "insufficient balance");
                Err(GenQueueError::InsufficientBalance {
                    balance,
                    required: self.cost,
                })
            }
        }
    }

    /// Return credits taken by `auth`.  Errors are reported to the caller
    /// but never retried here.
    pub async fn refund(&self, auth: &Authorization, reason: &str) -> Result<i64> {
        let lock = self.lock_for(&auth.actor);
        let _guard = lock.lock().await;

        let balance = self.ledger.credit(&auth.actor, auth.amount, reason).await?;
        info!(actor = %auth.actor, amount = auth.amount, balance, reason, "credits refunded");
        Ok(balance)
    }

    /// Refund after a failed generation, logging instead of propagating a
    /// refund failure so the original error still reaches the user.
    pub async fn refund_failed_generation(&self, auth: &Authorization) {
        if let Err(e) = self.refund(auth, REFUND_REASON).await {
            error!(actor = %auth.actor, amount = auth.amount, err = %e, "refund failed");
        }
    }
}
