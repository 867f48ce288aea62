//! Balance store: per-user spendable token units.
//!
//! Balances never go negative. They are mutated in exactly two places —
//! stake placement debits and settlement/refund credits — and both run
//! inside the market repository's transaction so no debit can land without
//! its stake row (or credit without its settlement row). Deposits are the
//! entry point for the external wallet collaborator.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::market::model::UserBalance;
use crate::market::store::{from_millis, to_millis, MarketDb};

pub(crate) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS balances (
            user_id TEXT PRIMARY KEY,
            balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
            total_deposited INTEGER NOT NULL DEFAULT 0,
            total_returned INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Current spendable units for a user; absent row reads as zero.
pub(crate) fn spendable(conn: &Connection, user_id: &str) -> rusqlite::Result<i64> {
    let balance = conn
        .query_row(
            "SELECT balance FROM balances WHERE user_id = ?1",
            [user_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(balance.unwrap_or(0))
}

/// Guarded debit: only succeeds if the row exists with enough balance.
/// Returns false when the funds are not there, leaving the row untouched.
pub(crate) fn debit(
    conn: &Connection,
    user_id: &str,
    amount: i64,
    now_ms: i64,
) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE balances SET balance = balance - ?1, updated_at = ?2
         WHERE user_id = ?3 AND balance >= ?1",
        params![amount, now_ms, user_id],
    )?;
    Ok(updated == 1)
}

/// Credit a payout or refund. Upsert form: anyone holding a stake already
/// has a row, but a missing one must not lose the credit.
pub(crate) fn credit(
    conn: &Connection,
    user_id: &str,
    amount: i64,
    now_ms: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO balances (user_id, balance, total_returned, updated_at)
         VALUES (?1, ?2, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET
            balance = balance + excluded.balance,
            total_returned = total_returned + excluded.balance,
            updated_at = excluded.updated_at",
        params![user_id, amount, now_ms],
    )?;
    Ok(())
}

#[derive(Clone)]
pub struct BalanceStore {
    conn: Arc<Mutex<Connection>>,
}

impl BalanceStore {
    /// The balance table lives in the engine database so stake commits can
    /// span both atomically.
    pub fn sharing(db: &MarketDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    pub async fn get(&self, user_id: &str) -> Result<UserBalance, EngineError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT user_id, balance, total_deposited, total_returned, updated_at
                 FROM balances WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok(UserBalance {
                        user_id: row.get(0)?,
                        balance: row.get(1)?,
                        total_deposited: row.get(2)?,
                        total_returned: row.get(3)?,
                        updated_at: from_millis(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or_else(|| UserBalance::empty(user_id)))
    }

    /// Credit spendable units from the wallet collaborator.
    pub async fn deposit(
        &self,
        user_id: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<UserBalance, EngineError> {
        if amount <= 0 {
            return Err(EngineError::InvalidDeposit(
                "amount must be positive".to_string(),
            ));
        }

        {
            let conn = self.conn.lock().await;
            conn.execute(
                "INSERT INTO balances (user_id, balance, total_deposited, updated_at)
                 VALUES (?1, ?2, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    balance = balance + excluded.balance,
                    total_deposited = total_deposited + excluded.balance,
                    updated_at = excluded.updated_at",
                params![user_id, amount, to_millis(now)],
            )?;
        }

        self.get(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_store() -> (BalanceStore, MarketDb, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db = MarketDb::new(temp_file.path().to_str().unwrap()).unwrap();
        let store = BalanceStore::sharing(&db);
        (store, db, temp_file)
    }

    #[tokio::test]
    async fn test_missing_user_reads_as_zero() {
        let (store, _db, _temp) = create_test_store();
        let balance = store.get("nobody").await.unwrap();
        assert_eq!(balance.balance, 0);
        assert_eq!(balance.total_deposited, 0);
    }

    #[tokio::test]
    async fn test_deposit_accumulates() {
        let (store, _db, _temp) = create_test_store();
        store.deposit("alice", 100, Utc::now()).await.unwrap();
        let balance = store.deposit("alice", 50, Utc::now()).await.unwrap();
        assert_eq!(balance.balance, 150);
        assert_eq!(balance.total_deposited, 150);

        assert!(store.deposit("alice", 0, Utc::now()).await.is_err());
        assert!(store.deposit("alice", -5, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_debit_refuses_overdraft() {
        let (store, db, _temp) = create_test_store();
        store.deposit("alice", 30, Utc::now()).await.unwrap();

        let conn = db.connection();
        let guard = conn.lock().await;
        assert!(debit(&guard, "alice", 20, 0).unwrap());
        assert!(!debit(&guard, "alice", 20, 0).unwrap());
        assert_eq!(spendable(&guard, "alice").unwrap(), 10);

        // Debiting an unknown user fails rather than creating debt.
        assert!(!debit(&guard, "bob", 1, 0).unwrap());

        credit(&guard, "alice", 5, 0).unwrap();
        assert_eq!(spendable(&guard, "alice").unwrap(), 15);
    }
}
