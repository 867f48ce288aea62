//! Settlement: resolve an expired market and redistribute its pool
//! exactly once.
//!
//! The payout formula is the parimutuel ratio: each winning stake takes its
//! proportional share of the entire pool, `stake * total_pool /
//! winners_pool`, computed in widened integer math and truncated downward so
//! the total credited never exceeds the pool.

use chrono::Utc;
use tracing::info;

use crate::error::EngineError;

use super::events::{EventBus, MarketEvent};
use super::model::{SettlementKind, SettlementResult};
use super::store::MarketDb;

#[derive(Clone)]
pub struct SettlementService {
    db: MarketDb,
    events: EventBus,
}

impl SettlementService {
    pub fn new(db: MarketDb, events: EventBus) -> Self {
        Self { db, events }
    }

    /// Apply the resolver's outcome. `None` voids the market (underlying
    /// event cancelled) and refunds every stake. Safe to retry: a repeat
    /// call returns the stored result without touching balances again.
    pub async fn settle(
        &self,
        market_id: &str,
        winning_option: Option<&str>,
    ) -> Result<SettlementResult, EngineError> {
        let result = self.db.settle(market_id, winning_option, Utc::now()).await?;

        info!(
            market_id,
            kind = ?result.kind,
            winning_option = result.winning_option.as_deref().unwrap_or("-"),
            total_pool = result.total_pool,
            total_paid = result.total_paid,
            winners = result.winner_count,
            "market settled"
        );
        let event = match result.kind {
            SettlementKind::Voided => MarketEvent::MarketVoided {
                market_id: result.market_id.clone(),
                total_pool: result.total_pool,
                refunded_count: result.refunded_count,
            },
            _ => MarketEvent::MarketSettled {
                market_id: result.market_id.clone(),
                kind: result.kind,
                winning_option: result.winning_option.clone(),
                total_pool: result.total_pool,
                total_paid: result.total_paid,
            },
        };
        self.events.publish(event);

        Ok(result)
    }
}
