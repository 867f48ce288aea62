//! SQLite-backed market repository.
//!
//! One connection guarded by an async mutex serializes every mutation, and
//! each mutating operation is a single transaction that re-validates its
//! preconditions after acquiring the lock. That gives the two guarantees the
//! engine needs: racing duplicate placements cannot both commit, and a crash
//! mid-settlement leaves either everything or nothing applied.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::balance;
use crate::error::EngineError;

use super::model::{
    Market, MarketStatus, Pool, SettlementKind, SettlementResult, Stake, StakeSettlement,
    StakeStatus,
};
use super::placement::validate_placement;

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[derive(Clone)]
pub struct MarketDb {
    conn: Arc<Mutex<Connection>>,
}

impl MarketDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open market db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        Self::init_schema(&conn)?;
        balance::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS markets (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                options TEXT NOT NULL,
                stake_amount INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                winning_option TEXT,
                created_at INTEGER NOT NULL,
                settled_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_markets_status_expiry
             ON markets(status, expires_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pools (
                market_id TEXT NOT NULL,
                option_value TEXT NOT NULL,
                total_stakes INTEGER NOT NULL DEFAULT 0,
                participant_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (market_id, option_value),
                FOREIGN KEY (market_id) REFERENCES markets(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS stakes (
                id TEXT PRIMARY KEY,
                market_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                selected_option TEXT NOT NULL,
                stake_amount INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                actual_return INTEGER NOT NULL DEFAULT 0,
                placed_at INTEGER NOT NULL,
                settled_at INTEGER,
                FOREIGN KEY (market_id) REFERENCES markets(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_stakes_market_user
             ON stakes(market_id, user_id)",
            [],
        )?;
        // Commit-time backstop for the one-live-bet-per-market invariant.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_stakes_one_active
             ON stakes(market_id, user_id) WHERE status = 'active'",
            [],
        )?;

        Ok(())
    }

    /// Create a market with zero-initialized pools for every option.
    pub async fn create_market(
        &self,
        question: &str,
        options: &[String],
        stake_amount: i64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Market, EngineError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(EngineError::InvalidMarket("question is empty".to_string()));
        }

        let options: Vec<String> = options.iter().map(|o| o.trim().to_string()).collect();
        if options.len() < 2 {
            return Err(EngineError::InvalidMarket(
                "a market needs at least two outcome options".to_string(),
            ));
        }
        if options.iter().any(|o| o.is_empty()) {
            return Err(EngineError::InvalidMarket(
                "outcome options must be non-empty".to_string(),
            ));
        }
        for (i, option) in options.iter().enumerate() {
            if options[..i].contains(option) {
                return Err(EngineError::InvalidMarket(format!(
                    "duplicate outcome option '{option}'"
                )));
            }
        }
        if stake_amount <= 0 {
            return Err(EngineError::InvalidMarket(
                "stake_amount must be positive".to_string(),
            ));
        }
        if expires_at <= now {
            return Err(EngineError::InvalidMarket(
                "expires_at must be in the future".to_string(),
            ));
        }

        let market = Market {
            id: Uuid::new_v4().to_string(),
            question: question.to_string(),
            options,
            stake_amount,
            expires_at,
            status: MarketStatus::Active,
            winning_option: None,
            created_at: now,
            settled_at: None,
        };

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(EngineError::from)?;

        tx.execute(
            "INSERT INTO markets (id, question, options, stake_amount, expires_at, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                market.id,
                market.question,
                serde_json::to_string(&market.options)?,
                market.stake_amount,
                to_millis(market.expires_at),
                market.status.as_str(),
                to_millis(market.created_at),
            ],
        )?;
        for option in &market.options {
            tx.execute(
                "INSERT INTO pools (market_id, option_value) VALUES (?1, ?2)",
                params![market.id, option],
            )?;
        }

        tx.commit().map_err(EngineError::from)?;
        Ok(market)
    }

    pub async fn get_market(&self, market_id: &str) -> Result<Option<Market>, EngineError> {
        let conn = self.conn.lock().await;
        load_market(&conn, market_id)
    }

    pub async fn list_markets(
        &self,
        status: Option<MarketStatus>,
    ) -> Result<Vec<Market>, EngineError> {
        let conn = self.conn.lock().await;

        let mut out = Vec::new();
        let rows: Vec<MarketRow> = if let Some(status) = status {
            let mut stmt = conn.prepare_cached(
                "SELECT id, question, options, stake_amount, expires_at, status, winning_option, created_at, settled_at
                 FROM markets WHERE status = ?1 ORDER BY created_at DESC",
            )?;
            let mapped = stmt.query_map([status.as_str()], map_market_row)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = conn.prepare_cached(
                "SELECT id, question, options, stake_amount, expires_at, status, winning_option, created_at, settled_at
                 FROM markets ORDER BY created_at DESC",
            )?;
            let mapped = stmt.query_map([], map_market_row)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for row in rows {
            out.push(row.into_market()?);
        }
        Ok(out)
    }

    pub async fn get_pools(&self, market_id: &str) -> Result<Vec<Pool>, EngineError> {
        let conn = self.conn.lock().await;
        load_pools(&conn, market_id)
    }

    /// A user's stake on a market, if any. At most one exists while the
    /// market is live; re-betting is impossible before settlement.
    pub async fn get_user_stake(
        &self,
        market_id: &str,
        user_id: &str,
    ) -> Result<Option<Stake>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, market_id, user_id, selected_option, stake_amount, status, actual_return, placed_at, settled_at
             FROM stakes WHERE market_id = ?1 AND user_id = ?2
             ORDER BY placed_at DESC, id LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![market_id, user_id], map_stake_row)
            .optional()?;
        row.map(StakeRow::into_stake).transpose()
    }

    pub async fn stakes_for_market(&self, market_id: &str) -> Result<Vec<Stake>, EngineError> {
        let conn = self.conn.lock().await;
        load_stakes(&conn, market_id)
    }

    /// Validate and commit one stake: debit the balance, insert the stake
    /// row, and increment the target pool — all inside one transaction.
    /// Preconditions are checked against state read under the same
    /// transaction, and the wall clock is read only after the connection
    /// lock is held, so a request still queued when the deadline passes is
    /// rejected here rather than validated against the time it arrived.
    ///
    /// Returns the committed stake plus the market's fresh pool totals for
    /// the "stake placed" event.
    pub async fn place_stake(
        &self,
        market_id: &str,
        user_id: &str,
        selected_option: &str,
        stake_amount: i64,
    ) -> Result<(Stake, Vec<Pool>), EngineError> {
        let mut conn = self.conn.lock().await;
        let now = Utc::now();
        Self::place_stake_tx(&mut conn, market_id, user_id, selected_option, stake_amount, now)
    }

    /// Variant with an explicit clock.
    pub(crate) async fn place_stake_at(
        &self,
        market_id: &str,
        user_id: &str,
        selected_option: &str,
        stake_amount: i64,
        now: DateTime<Utc>,
    ) -> Result<(Stake, Vec<Pool>), EngineError> {
        let mut conn = self.conn.lock().await;
        Self::place_stake_tx(&mut conn, market_id, user_id, selected_option, stake_amount, now)
    }

    fn place_stake_tx(
        conn: &mut Connection,
        market_id: &str,
        user_id: &str,
        selected_option: &str,
        stake_amount: i64,
        now: DateTime<Utc>,
    ) -> Result<(Stake, Vec<Pool>), EngineError> {
        let tx = conn.transaction().map_err(EngineError::from)?;

        // Precondition 1 folds a missing market into MarketNotOpen.
        let market = load_market(&tx, market_id)?.ok_or(EngineError::MarketNotOpen)?;

        let has_active_stake: bool = tx.query_row(
            "SELECT COUNT(*) FROM stakes
             WHERE market_id = ?1 AND user_id = ?2 AND status = 'active'",
            params![market_id, user_id],
            |row| row.get::<_, i64>(0),
        )? > 0;
        let spendable = balance::spendable(&tx, user_id)?;

        validate_placement(
            &market,
            now,
            selected_option,
            stake_amount,
            has_active_stake,
            spendable,
        )?;

        if !balance::debit(&tx, user_id, stake_amount, to_millis(now))? {
            // The guarded update is the authoritative check.
            return Err(EngineError::InsufficientBalance);
        }

        let stake = Stake {
            id: Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            user_id: user_id.to_string(),
            selected_option: selected_option.to_string(),
            stake_amount,
            status: StakeStatus::Active,
            actual_return: 0,
            placed_at: now,
            settled_at: None,
        };
        tx.execute(
            "INSERT INTO stakes (id, market_id, user_id, selected_option, stake_amount, status, placed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                stake.id,
                stake.market_id,
                stake.user_id,
                stake.selected_option,
                stake.stake_amount,
                stake.status.as_str(),
                to_millis(stake.placed_at),
            ],
        )?;

        let updated = tx.execute(
            "UPDATE pools SET total_stakes = total_stakes + ?1, participant_count = participant_count + 1
             WHERE market_id = ?2 AND option_value = ?3",
            params![stake_amount, market_id, selected_option],
        )?;
        if updated != 1 {
            return Err(EngineError::Storage(anyhow!(
                "pool row missing for market {market_id} option {selected_option}"
            )));
        }

        let pools = load_pools(&tx, market_id)?;
        tx.commit().map_err(EngineError::from)?;
        Ok((stake, pools))
    }

    /// Flip every active market whose deadline has passed to expired.
    /// Idempotent: already-expired markets are untouched.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<String>, EngineError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(EngineError::from)?;
        let now_ms = to_millis(now);

        let due: Vec<String> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id FROM markets WHERE status = 'active' AND expires_at <= ?1
                 ORDER BY expires_at, id",
            )?;
            let mapped = stmt.query_map([now_ms], |row| row.get::<_, String>(0))?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };

        if !due.is_empty() {
            tx.execute(
                "UPDATE markets SET status = 'expired'
                 WHERE status = 'active' AND expires_at <= ?1",
                [now_ms],
            )?;
        }

        tx.commit().map_err(EngineError::from)?;
        Ok(due)
    }

    /// Resolve an expired market exactly once.
    ///
    /// A second call on an already-settled (or voided) market reconstructs
    /// and returns the stored result without mutating anything, so resolver
    /// retries are safe. The whole settlement — stake updates plus balance
    /// credits plus the market flip — is one transaction.
    pub async fn settle(
        &self,
        market_id: &str,
        winning_option: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SettlementResult, EngineError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(EngineError::from)?;

        let market = load_market(&tx, market_id)?.ok_or(EngineError::MarketNotFound)?;

        if market.status.is_terminal() {
            // Idempotent replay: no mutation, stored outcome only.
            return rebuild_result(&tx, &market);
        }
        if market.status != MarketStatus::Expired {
            return Err(EngineError::NotSettleable);
        }

        if let Some(winner) = winning_option {
            if !market.options.iter().any(|o| o == winner) {
                return Err(EngineError::InvalidOption);
            }
        }

        let pools = load_pools(&tx, market_id)?;
        let stakes = load_stakes(&tx, market_id)?;

        let total_pool: i64 = pools.iter().map(|p| p.total_stakes).sum();
        let staked_total: i64 = stakes.iter().map(|s| s.stake_amount).sum();
        if total_pool != staked_total {
            return Err(EngineError::InvariantViolation(format!(
                "market {market_id}: pool total {total_pool} != staked total {staked_total}"
            )));
        }

        let winners_pool = winning_option
            .and_then(|w| pools.iter().find(|p| p.option_value == w))
            .map(|p| p.total_stakes)
            .unwrap_or(0);

        let kind = match winning_option {
            Some(_) if winners_pool > 0 => SettlementKind::Paid,
            Some(_) => SettlementKind::RefundedNoWinners,
            None => SettlementKind::Voided,
        };

        let now_ms = to_millis(now);
        let mut settled_stakes = Vec::with_capacity(stakes.len());
        let mut winner_count = 0;
        let mut loser_count = 0;
        let mut refunded_count = 0;
        let mut total_paid: i64 = 0;

        for stake in &stakes {
            let (status, actual_return) = match kind {
                SettlementKind::Paid => {
                    if Some(stake.selected_option.as_str()) == winning_option {
                        // Proportional share of the entire pool, truncated
                        // downward on the token's smallest unit. Remainders
                        // are simply not distributed.
                        let payout = (stake.stake_amount as i128 * total_pool as i128
                            / winners_pool as i128) as i64;
                        (StakeStatus::Won, payout)
                    } else {
                        (StakeStatus::Lost, 0)
                    }
                }
                SettlementKind::RefundedNoWinners | SettlementKind::Voided => {
                    (StakeStatus::Refunded, stake.stake_amount)
                }
            };

            tx.execute(
                "UPDATE stakes SET status = ?1, actual_return = ?2, settled_at = ?3 WHERE id = ?4",
                params![status.as_str(), actual_return, now_ms, stake.id],
            )?;
            if actual_return > 0 {
                balance::credit(&tx, &stake.user_id, actual_return, now_ms)?;
            }

            match status {
                StakeStatus::Won => winner_count += 1,
                StakeStatus::Lost => loser_count += 1,
                StakeStatus::Refunded => refunded_count += 1,
                StakeStatus::Active => {}
            }
            total_paid += actual_return;

            settled_stakes.push(StakeSettlement {
                stake_id: stake.id.clone(),
                user_id: stake.user_id.clone(),
                selected_option: stake.selected_option.clone(),
                status,
                actual_return,
            });
        }

        let final_status = match kind {
            SettlementKind::Voided => MarketStatus::Void,
            _ => MarketStatus::Settled,
        };
        tx.execute(
            "UPDATE markets SET status = ?1, winning_option = ?2, settled_at = ?3 WHERE id = ?4",
            params![final_status.as_str(), winning_option, now_ms, market_id],
        )?;

        tx.commit().map_err(EngineError::from)?;

        Ok(SettlementResult {
            market_id: market_id.to_string(),
            kind,
            winning_option: winning_option.map(|s| s.to_string()),
            total_pool,
            winners_pool,
            winner_count,
            loser_count,
            refunded_count,
            total_paid,
            stakes: settled_stakes,
        })
    }
}

/// Reconstruct the settlement outcome of a terminal market from its stored
/// rows. Pools are never mutated after expiry, so this is byte-for-byte the
/// result the original settlement returned.
fn rebuild_result(conn: &Connection, market: &Market) -> Result<SettlementResult, EngineError> {
    let pools = load_pools(conn, &market.id)?;
    let stakes = load_stakes(conn, &market.id)?;

    let total_pool: i64 = pools.iter().map(|p| p.total_stakes).sum();
    let winners_pool = market
        .winning_option
        .as_deref()
        .and_then(|w| pools.iter().find(|p| p.option_value == w))
        .map(|p| p.total_stakes)
        .unwrap_or(0);

    let kind = match market.status {
        MarketStatus::Void => SettlementKind::Voided,
        _ if winners_pool > 0 => SettlementKind::Paid,
        _ => SettlementKind::RefundedNoWinners,
    };

    let mut winner_count = 0;
    let mut loser_count = 0;
    let mut refunded_count = 0;
    let mut total_paid: i64 = 0;
    let settled_stakes: Vec<StakeSettlement> = stakes
        .iter()
        .map(|stake| {
            match stake.status {
                StakeStatus::Won => winner_count += 1,
                StakeStatus::Lost => loser_count += 1,
                StakeStatus::Refunded => refunded_count += 1,
                StakeStatus::Active => {}
            }
            total_paid += stake.actual_return;
            StakeSettlement {
                stake_id: stake.id.clone(),
                user_id: stake.user_id.clone(),
                selected_option: stake.selected_option.clone(),
                status: stake.status,
                actual_return: stake.actual_return,
            }
        })
        .collect();

    Ok(SettlementResult {
        market_id: market.id.clone(),
        kind,
        winning_option: market.winning_option.clone(),
        total_pool,
        winners_pool,
        winner_count,
        loser_count,
        refunded_count,
        total_paid,
        stakes: settled_stakes,
    })
}

struct MarketRow {
    id: String,
    question: String,
    options_json: String,
    stake_amount: i64,
    expires_at: i64,
    status: String,
    winning_option: Option<String>,
    created_at: i64,
    settled_at: Option<i64>,
}

impl MarketRow {
    fn into_market(self) -> Result<Market, EngineError> {
        let options: Vec<String> = serde_json::from_str(&self.options_json)?;
        let status = MarketStatus::from_str(&self.status)
            .ok_or_else(|| EngineError::Storage(anyhow!("unknown market status {}", self.status)))?;
        Ok(Market {
            id: self.id,
            question: self.question,
            options,
            stake_amount: self.stake_amount,
            expires_at: from_millis(self.expires_at),
            status,
            winning_option: self.winning_option,
            created_at: from_millis(self.created_at),
            settled_at: self.settled_at.map(from_millis),
        })
    }
}

fn map_market_row(row: &rusqlite::Row) -> rusqlite::Result<MarketRow> {
    Ok(MarketRow {
        id: row.get(0)?,
        question: row.get(1)?,
        options_json: row.get(2)?,
        stake_amount: row.get(3)?,
        expires_at: row.get(4)?,
        status: row.get(5)?,
        winning_option: row.get(6)?,
        created_at: row.get(7)?,
        settled_at: row.get(8)?,
    })
}

fn load_market(conn: &Connection, market_id: &str) -> Result<Option<Market>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, question, options, stake_amount, expires_at, status, winning_option, created_at, settled_at
         FROM markets WHERE id = ?1",
    )?;
    let row = stmt.query_row([market_id], map_market_row).optional()?;
    row.map(MarketRow::into_market).transpose()
}

fn load_pools(conn: &Connection, market_id: &str) -> Result<Vec<Pool>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT market_id, option_value, total_stakes, participant_count
         FROM pools WHERE market_id = ?1 ORDER BY rowid",
    )?;
    let mapped = stmt.query_map([market_id], |row| {
        Ok(Pool {
            market_id: row.get(0)?,
            option_value: row.get(1)?,
            total_stakes: row.get(2)?,
            participant_count: row.get(3)?,
        })
    })?;
    Ok(mapped.collect::<rusqlite::Result<Vec<_>>>()?)
}

struct StakeRow {
    id: String,
    market_id: String,
    user_id: String,
    selected_option: String,
    stake_amount: i64,
    status: String,
    actual_return: i64,
    placed_at: i64,
    settled_at: Option<i64>,
}

impl StakeRow {
    fn into_stake(self) -> Result<Stake, EngineError> {
        let status = StakeStatus::from_str(&self.status)
            .ok_or_else(|| EngineError::Storage(anyhow!("unknown stake status {}", self.status)))?;
        Ok(Stake {
            id: self.id,
            market_id: self.market_id,
            user_id: self.user_id,
            selected_option: self.selected_option,
            stake_amount: self.stake_amount,
            status,
            actual_return: self.actual_return,
            placed_at: from_millis(self.placed_at),
            settled_at: self.settled_at.map(from_millis),
        })
    }
}

fn map_stake_row(row: &rusqlite::Row) -> rusqlite::Result<StakeRow> {
    Ok(StakeRow {
        id: row.get(0)?,
        market_id: row.get(1)?,
        user_id: row.get(2)?,
        selected_option: row.get(3)?,
        stake_amount: row.get(4)?,
        status: row.get(5)?,
        actual_return: row.get(6)?,
        placed_at: row.get(7)?,
        settled_at: row.get(8)?,
    })
}

fn load_stakes(conn: &Connection, market_id: &str) -> Result<Vec<Stake>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, market_id, user_id, selected_option, stake_amount, status, actual_return, placed_at, settled_at
         FROM stakes WHERE market_id = ?1 ORDER BY placed_at, id",
    )?;
    let mapped = stmt.query_map([market_id], map_stake_row)?;
    let rows = mapped.collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(StakeRow::into_stake).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (MarketDb, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db = MarketDb::new(temp_file.path().to_str().unwrap()).unwrap();
        (db, temp_file)
    }

    async fn fund(db: &MarketDb, user: &str, amount: i64) {
        let store = crate::balance::BalanceStore::sharing(db);
        store.deposit(user, amount, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_market_initializes_pools() {
        let (db, _temp) = create_test_db();
        let now = Utc::now();
        let market = db
            .create_market(
                "Who scores next?",
                &["1".to_string(), "X".to_string(), "2".to_string()],
                10,
                now + Duration::minutes(5),
                now,
            )
            .await
            .unwrap();

        assert_eq!(market.status, MarketStatus::Active);
        let pools = db.get_pools(&market.id).await.unwrap();
        assert_eq!(pools.len(), 3);
        assert!(pools.iter().all(|p| p.total_stakes == 0 && p.participant_count == 0));
    }

    #[tokio::test]
    async fn test_create_market_rejects_bad_input() {
        let (db, _temp) = create_test_db();
        let now = Utc::now();
        let later = now + Duration::minutes(5);
        let opts = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        for (question, options, stake, expires) in [
            ("", opts(&["a", "b"]), 10, later),
            ("q", opts(&["only"]), 10, later),
            ("q", opts(&["a", "a"]), 10, later),
            ("q", opts(&["a", ""]), 10, later),
            ("q", opts(&["a", "b"]), 0, later),
            ("q", opts(&["a", "b"]), 10, now - Duration::seconds(1)),
        ] {
            let err = db
                .create_market(question, &options, stake, expires, now)
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidMarket(_)));
        }
    }

    #[tokio::test]
    async fn test_place_stake_updates_pool_and_balance() {
        let (db, _temp) = create_test_db();
        let now = Utc::now();
        let market = db
            .create_market(
                "Result?",
                &["1".to_string(), "2".to_string()],
                10,
                now + Duration::minutes(5),
                now,
            )
            .await
            .unwrap();
        fund(&db, "alice", 25).await;

        let (stake, pools) = db
            .place_stake_at(&market.id, "alice", "1", 10, now)
            .await
            .unwrap();
        assert_eq!(stake.status, StakeStatus::Active);
        assert_eq!(stake.actual_return, 0);

        let pool = pools.iter().find(|p| p.option_value == "1").unwrap();
        assert_eq!(pool.total_stakes, 10);
        assert_eq!(pool.participant_count, 1);

        let balances = crate::balance::BalanceStore::sharing(&db);
        assert_eq!(balances.get("alice").await.unwrap().balance, 15);
    }

    #[tokio::test]
    async fn test_place_stake_precondition_order() {
        let (db, _temp) = create_test_db();
        let now = Utc::now();
        let market = db
            .create_market(
                "Result?",
                &["1".to_string(), "2".to_string()],
                10,
                now + Duration::minutes(5),
                now,
            )
            .await
            .unwrap();

        // Unknown market folds into MarketNotOpen.
        let err = db.place_stake_at("nope", "alice", "1", 10, now).await.unwrap_err();
        assert!(matches!(err, EngineError::MarketNotOpen));

        // Bad option beats bad amount.
        let err = db
            .place_stake_at(&market.id, "alice", "9", 5, now)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOption));

        // Amount mismatch beats missing balance.
        let err = db
            .place_stake_at(&market.id, "alice", "1", 5, now)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StakeAmountMismatch));

        // No balance at all.
        let err = db
            .place_stake_at(&market.id, "alice", "1", 10, now)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance));

        fund(&db, "alice", 30).await;
        db.place_stake_at(&market.id, "alice", "1", 10, now).await.unwrap();

        // Second live bet on the same market is refused even with funds.
        let err = db
            .place_stake_at(&market.id, "alice", "2", 10, now)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateBet));
    }

    #[tokio::test]
    async fn test_place_stake_rejected_after_deadline() {
        let (db, _temp) = create_test_db();
        let now = Utc::now();
        let market = db
            .create_market(
                "Result?",
                &["1".to_string(), "2".to_string()],
                10,
                now + Duration::minutes(5),
                now,
            )
            .await
            .unwrap();
        fund(&db, "alice", 30).await;

        // Deadline passed but the sweep hasn't run: still rejected, and
        // neither pool nor balance moves.
        let late = now + Duration::minutes(6);
        let err = db
            .place_stake_at(&market.id, "alice", "1", 10, late)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MarketNotOpen));

        let pools = db.get_pools(&market.id).await.unwrap();
        assert!(pools.iter().all(|p| p.total_stakes == 0));
        let balances = crate::balance::BalanceStore::sharing(&db);
        assert_eq!(balances.get("alice").await.unwrap().balance, 30);
    }

    #[tokio::test]
    async fn test_placement_queued_past_deadline_is_rejected() {
        let (db, _temp) = create_test_db();
        let now = Utc::now();
        let market = db
            .create_market(
                "Result?",
                &["1".to_string(), "2".to_string()],
                10,
                now + Duration::milliseconds(50),
                now,
            )
            .await
            .unwrap();
        fund(&db, "alice", 30).await;

        // Hold the connection lock while a placement waits on it, and
        // release only after the deadline has passed. The placement must
        // validate against the clock at commit time, not at arrival.
        let conn = db.connection();
        let guard = conn.lock().await;
        let pending = {
            let db = db.clone();
            let market_id = market.id.clone();
            tokio::spawn(async move { db.place_stake(&market_id, "alice", "1", 10).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        drop(guard);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::MarketNotOpen));

        let pools = db.get_pools(&market.id).await.unwrap();
        assert!(pools.iter().all(|p| p.total_stakes == 0));
        let balances = crate::balance::BalanceStore::sharing(&db);
        assert_eq!(balances.get("alice").await.unwrap().balance, 30);
    }

    #[tokio::test]
    async fn test_settle_halts_when_pools_diverge_from_stakes() {
        let (db, _temp) = create_test_db();
        let now = Utc::now();
        let market = db
            .create_market(
                "Result?",
                &["1".to_string(), "2".to_string()],
                10,
                now + Duration::minutes(5),
                now,
            )
            .await
            .unwrap();
        fund(&db, "alice", 10).await;
        db.place_stake_at(&market.id, "alice", "1", 10, now).await.unwrap();
        db.expire_due(now + Duration::minutes(6)).await.unwrap();

        // Corrupt the pool ledger out-of-band.
        {
            let conn = db.connection();
            let guard = conn.lock().await;
            guard
                .execute(
                    "UPDATE pools SET total_stakes = total_stakes + 7
                     WHERE market_id = ?1 AND option_value = '1'",
                    [market.id.as_str()],
                )
                .unwrap();
        }

        let err = db
            .settle(&market.id, Some("1"), now + Duration::minutes(7))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));

        // Halted before any mutation: the market stays expired, the stake
        // stays active, and no balance was credited.
        let market = db.get_market(&market.id).await.unwrap().unwrap();
        assert_eq!(market.status, MarketStatus::Expired);
        let stake = db.get_user_stake(&market.id, "alice").await.unwrap().unwrap();
        assert_eq!(stake.status, StakeStatus::Active);
        let balances = crate::balance::BalanceStore::sharing(&db);
        assert_eq!(balances.get("alice").await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_expire_due_is_idempotent() {
        let (db, _temp) = create_test_db();
        let now = Utc::now();
        let market = db
            .create_market(
                "Result?",
                &["1".to_string(), "2".to_string()],
                10,
                now + Duration::minutes(5),
                now,
            )
            .await
            .unwrap();

        assert!(db.expire_due(now).await.unwrap().is_empty());

        let later = now + Duration::minutes(6);
        let flipped = db.expire_due(later).await.unwrap();
        assert_eq!(flipped, vec![market.id.clone()]);

        // Second sweep is a no-op.
        assert!(db.expire_due(later).await.unwrap().is_empty());
        let market = db.get_market(&market.id).await.unwrap().unwrap();
        assert_eq!(market.status, MarketStatus::Expired);
    }
}
