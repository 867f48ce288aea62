//! Stake placement: precondition checks and the commit path.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::EngineError;

use super::events::{EventBus, MarketEvent};
use super::model::{Market, Stake};
use super::store::MarketDb;

/// Precondition checks in contract order, each a distinct fail-fast error.
///
/// Pure over a state snapshot so it can run (and re-run) inside the commit
/// transaction: a request that raced past a stale check gets caught against
/// the state it would actually commit into.
pub fn validate_placement(
    market: &Market,
    now: DateTime<Utc>,
    selected_option: &str,
    stake_amount: i64,
    has_active_stake: bool,
    spendable: i64,
) -> Result<(), EngineError> {
    if !market.is_open(now) {
        return Err(EngineError::MarketNotOpen);
    }
    if !market.options.iter().any(|o| o == selected_option) {
        return Err(EngineError::InvalidOption);
    }
    if stake_amount != market.stake_amount {
        return Err(EngineError::StakeAmountMismatch);
    }
    if has_active_stake {
        return Err(EngineError::DuplicateBet);
    }
    if spendable < stake_amount {
        return Err(EngineError::InsufficientBalance);
    }
    Ok(())
}

/// Validates and commits bets against the balance store and market
/// repository, then broadcasts the pool change for live odds refresh.
#[derive(Clone)]
pub struct StakePlacement {
    db: MarketDb,
    events: EventBus,
}

impl StakePlacement {
    pub fn new(db: MarketDb, events: EventBus) -> Self {
        Self { db, events }
    }

    pub async fn place(
        &self,
        market_id: &str,
        user_id: &str,
        selected_option: &str,
        stake_amount: i64,
    ) -> Result<Stake, EngineError> {
        let (stake, pools) = self
            .db
            .place_stake(market_id, user_id, selected_option, stake_amount)
            .await?;

        info!(
            market_id,
            user_id, selected_option, stake_amount, "stake placed"
        );
        self.events.publish(MarketEvent::StakePlaced {
            market_id: stake.market_id.clone(),
            user_id: stake.user_id.clone(),
            selected_option: stake.selected_option.clone(),
            stake_amount: stake.stake_amount,
            pools,
        });

        Ok(stake)
    }
}
