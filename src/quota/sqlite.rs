use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

use super::{LedgerEntry, QuotaLedger};
use crate::error::{GenQueueError, Result};

/// Credit ledger stored in the local SQLite database.
///
/// Users the ledger has never seen are seeded with `initial_balance` on
/// first touch.  Every balance change writes a `quota_ledger` row in the
/// same transaction.
pub struct SqliteLedger {
    db: Arc<Mutex<Connection>>,
    initial_balance: i64,
}

impl SqliteLedger {
    pub fn new(db: Arc<Mutex<Connection>>, initial_balance: i64) -> Self {
        Self { db, initial_balance }
    }

    fn ensure_account(conn: &Connection, actor: &str, initial: i64) -> Result<()> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO quota_balances (user_id, balance) VALUES (?1, ?2)",
            params![actor, initial],
        )?;
        if inserted > 0 && initial > 0 {
            conn.execute(
                "INSERT INTO quota_ledger (user_id, delta, balance_after, reason) VALUES (?1, ?2, ?2, 'initial grant')",
                params![actor, initial],
            )?;
        }
        Ok(())
    }

    fn current(conn: &Connection, actor: &str) -> Result<i64> {
        let balance: Option<i64> = conn
            .query_row(
                "SELECT balance FROM quota_balances WHERE user_id = ?1",
                [actor],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0))
    }
}

#[async_trait::async_trait]
impl QuotaLedger for SqliteLedger {
    async fn balance(&self, actor: &str) -> Result<i64> {
        let db = self.db.lock().await;
        Self::ensure_account(&db, actor, self.initial_balance)?;
        Self::current(&db, actor)
    }

    async fn try_debit(&self, actor: &str, amount: i64, reason: &str) -> Result<Option<i64>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        Self::ensure_account(&tx, actor, self.initial_balance)?;

        let changed = tx.execute(
            "UPDATE quota_balances SET balance = balance - ?2, updated_at = datetime('now')
             WHERE user_id = ?1 AND balance >= ?2",
            params![actor, amount],
        )?;
        if changed == 0 {
            // Commit anyway so a freshly seeded account is kept.
            tx.commit()?;
            return Ok(None);
        }

        let balance = Self::current(&tx, actor)?;
        tx.execute(
            "INSERT INTO quota_ledger (user_id, delta, balance_after, reason) VALUES (?1, ?2, ?3, ?4)",
            params![actor, -amount, balance, reason],
        )?;
        tx.commit()?;
        Ok(Some(balance))
    }

    async fn credit(&self, actor: &str, amount: i64, reason: &str) -> Result<i64> {
        if amount < 0 {
            return Err(GenQueueError::Config(format!(
                "credit amount must not be negative, got {amount}"
            )));
        }
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        Self::ensure_account(&tx, actor, self.initial_balance)?;
        tx.execute(
            "UPDATE quota_balances SET balance = balance + ?2, updated_at = datetime('now')
             WHERE user_id = ?1",
            params![actor, amount],
        )?;
        let balance = Self::current(&tx, actor)?;
        tx.execute(
            "INSERT INTO quota_ledger (user_id, delta, balance_after, reason) VALUES (?1, ?2, ?3, ?4)",
            params![actor, amount, balance, reason],
        )?;
        tx.commit()?;
        Ok(balance)
    }

    async fn entries(&self, actor: &str, limit: usize) -> Result<Vec<LedgerEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, user_id, delta, balance_after, reason, created_at
             FROM quota_ledger WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![actor, limit as i64], |row| {
                Ok(LedgerEntry {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    delta: row.get(2)?,
                    balance_after: row.get(3)?,
                    reason: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}
