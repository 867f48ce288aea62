//! Core data model: markets, pools, stakes, settlement results.
//!
//! Token amounts are i64 counts of the token's smallest unit. Odds and pool
//! percentages are display-only f64 projections computed in [`super::odds`];
//! all money arithmetic stays on integers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Market lifecycle. Transitions are monotonic:
/// active -> expired -> {settled, void}; settled and void are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Active,
    Expired,
    Settled,
    Void,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Active => "active",
            MarketStatus::Expired => "expired",
            MarketStatus::Settled => "settled",
            MarketStatus::Void => "void",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MarketStatus::Active),
            "expired" => Some(MarketStatus::Expired),
            "settled" => Some(MarketStatus::Settled),
            "void" => Some(MarketStatus::Void),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MarketStatus::Settled | MarketStatus::Void)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StakeStatus {
    Active,
    Won,
    Lost,
    Refunded,
}

impl StakeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StakeStatus::Active => "active",
            StakeStatus::Won => "won",
            StakeStatus::Lost => "lost",
            StakeStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(StakeStatus::Active),
            "won" => Some(StakeStatus::Won),
            "lost" => Some(StakeStatus::Lost),
            "refunded" => Some(StakeStatus::Refunded),
            _ => None,
        }
    }
}

/// One betting market on a live-match micro-event.
///
/// All stakes on a market are the same fixed size (`stake_amount`), so each
/// option's pool total is always `stake_amount * participant_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    /// Ordered, distinct outcome labels (>= 2).
    pub options: Vec<String>,
    pub stake_amount: i64,
    pub expires_at: DateTime<Utc>,
    pub status: MarketStatus,
    /// Non-null iff status == settled; always a member of `options`.
    pub winning_option: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Market {
    /// Whether new stakes are accepted at `now`. Placement re-checks this
    /// inside its commit transaction, so scheduler latency can never let a
    /// bet slip in past the deadline.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.status == MarketStatus::Active && now < self.expires_at
    }
}

/// Aggregate stake total for one outcome option of a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub market_id: String,
    pub option_value: String,
    pub total_stakes: i64,
    pub participant_count: i64,
}

/// An individual user's bet on one option of one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stake {
    pub id: String,
    pub market_id: String,
    pub user_id: String,
    pub selected_option: String,
    pub stake_amount: i64,
    pub status: StakeStatus,
    /// 0 until settlement; then the credited payout (or refund).
    pub actual_return: i64,
    pub placed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Per-user spendable token units plus reconciliation counters for the
/// wallet collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBalance {
    pub user_id: String,
    pub balance: i64,
    pub total_deposited: i64,
    pub total_returned: i64,
    pub updated_at: DateTime<Utc>,
}

impl UserBalance {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            balance: 0,
            total_deposited: 0,
            total_returned: 0,
            updated_at: Utc::now(),
        }
    }
}

/// How a market's stakes were resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    /// Winners paid their proportional share of the whole pool.
    Paid,
    /// Winning option had an empty pool; every stake refunded.
    RefundedNoWinners,
    /// No winning option supplied (event cancelled); every stake refunded.
    Voided,
}

/// Per-stake outcome within a [`SettlementResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeSettlement {
    pub stake_id: String,
    pub user_id: String,
    pub selected_option: String,
    pub status: StakeStatus,
    pub actual_return: i64,
}

/// Outcome of settling one market. Settling an already-settled market
/// returns the identical stored result without further mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub market_id: String,
    pub kind: SettlementKind,
    pub winning_option: Option<String>,
    pub total_pool: i64,
    pub winners_pool: i64,
    pub winner_count: usize,
    pub loser_count: usize,
    pub refunded_count: usize,
    /// Sum of all credits applied; never exceeds `total_pool`.
    pub total_paid: i64,
    pub stakes: Vec<StakeSettlement>,
}
