//! Live odds projection.
//!
//! Pure functions over a pool snapshot: no state, no locks, recomputable
//! identically from any snapshot. Payout arithmetic stays on integers in the
//! settlement path; these f64 figures are for display only.

use serde::Serialize;

use super::model::{Market, Pool};

/// Implied payout multiplier for one option: `total_pool / option_pool`.
///
/// An option nobody has backed has no meaningful price, so `None` is
/// returned instead of dividing by zero.
pub fn odds(total_pool: i64, option_pool: i64) -> Option<f64> {
    if option_pool <= 0 {
        return None;
    }
    Some(total_pool as f64 / option_pool as f64)
}

/// Share of the whole pool sitting on one option, in percent.
/// An empty market yields 0% for every option.
pub fn percentage(total_pool: i64, option_pool: i64) -> f64 {
    if total_pool <= 0 {
        return 0.0;
    }
    option_pool as f64 / total_pool as f64 * 100.0
}

/// One option's pool with its live odds attached.
#[derive(Debug, Clone, Serialize)]
pub struct PoolView {
    pub option_value: String,
    pub total_stakes: i64,
    pub participant_count: i64,
    /// `None` until the option has at least one stake.
    pub odds: Option<f64>,
    pub percentage: f64,
}

/// Read-only market projection served to the UI: the market plus every
/// option's pool and live odds, in option order.
#[derive(Debug, Clone, Serialize)]
pub struct MarketView {
    #[serde(flatten)]
    pub market: Market,
    pub total_pool: i64,
    pub pools: Vec<PoolView>,
}

pub fn project(market: &Market, pools: &[Pool]) -> MarketView {
    let total_pool: i64 = pools.iter().map(|p| p.total_stakes).sum();

    let views = market
        .options
        .iter()
        .map(|option| {
            let (total_stakes, participant_count) = pools
                .iter()
                .find(|p| &p.option_value == option)
                .map(|p| (p.total_stakes, p.participant_count))
                .unwrap_or((0, 0));

            PoolView {
                option_value: option.clone(),
                total_stakes,
                participant_count,
                odds: odds(total_pool, total_stakes),
                percentage: percentage(total_pool, total_stakes),
            }
        })
        .collect();

    MarketView {
        market: market.clone(),
        total_pool,
        pools: views,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::model::MarketStatus;
    use chrono::{Duration, Utc};

    fn pool(option: &str, total: i64, count: i64) -> Pool {
        Pool {
            market_id: "m1".to_string(),
            option_value: option.to_string(),
            total_stakes: total,
            participant_count: count,
        }
    }

    #[test]
    fn test_odds_from_pool_ratio() {
        // Pools {"1": 20, "X": 0, "2": 10} -> total 30.
        assert_eq!(odds(30, 20), Some(1.5));
        assert_eq!(odds(30, 10), Some(3.0));
        assert_eq!(odds(30, 0), None);
    }

    #[test]
    fn test_percentage_handles_empty_market() {
        assert_eq!(percentage(0, 0), 0.0);
        assert!((percentage(30, 20) - 66.666_666_666_666_67).abs() < 1e-9);
        assert_eq!(percentage(30, 0), 0.0);
    }

    #[test]
    fn test_projection_is_deterministic_and_ordered() {
        let now = Utc::now();
        let market = Market {
            id: "m1".to_string(),
            question: "Full time result?".to_string(),
            options: vec!["1".to_string(), "X".to_string(), "2".to_string()],
            stake_amount: 10,
            expires_at: now + Duration::minutes(10),
            status: MarketStatus::Active,
            winning_option: None,
            created_at: now,
            settled_at: None,
        };
        // Pools arrive out of option order; projection must follow options.
        let pools = vec![pool("2", 10, 1), pool("1", 20, 2), pool("X", 0, 0)];

        let view = project(&market, &pools);
        assert_eq!(view.total_pool, 30);
        let labels: Vec<&str> = view.pools.iter().map(|p| p.option_value.as_str()).collect();
        assert_eq!(labels, vec!["1", "X", "2"]);
        assert_eq!(view.pools[0].odds, Some(1.5));
        assert_eq!(view.pools[1].odds, None);
        assert_eq!(view.pools[2].odds, Some(3.0));

        // Recomputing from the same snapshot yields identical numbers.
        let again = project(&market, &pools);
        assert_eq!(again.total_pool, view.total_pool);
        for (a, b) in again.pools.iter().zip(view.pools.iter()) {
            assert_eq!(a.odds, b.odds);
            assert_eq!(a.percentage, b.percentage);
        }
    }
}
