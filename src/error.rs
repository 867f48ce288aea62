//! Engine error taxonomy.
//!
//! Precondition failures are reported to the caller and never retried
//! automatically; storage faults are wrapped so transient contention can be
//! retried as a whole operation (every mutation is all-or-nothing).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("market is not open for betting")]
    MarketNotOpen,

    #[error("selected option is not one of the market's outcomes")]
    InvalidOption,

    #[error("stake must equal the market's fixed stake amount")]
    StakeAmountMismatch,

    #[error("user already has an active stake on this market")]
    DuplicateBet,

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("market cannot be settled in its current state")]
    NotSettleable,

    #[error("market not found")]
    MarketNotFound,

    #[error("invalid market: {0}")]
    InvalidMarket(String),

    #[error("invalid deposit: {0}")]
    InvalidDeposit(String),

    /// Pool totals diverged from stake rows. Settlement halts for manual
    /// audit instead of guessing a resolution.
    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::MarketNotOpen => "market_not_open",
            EngineError::InvalidOption => "invalid_option",
            EngineError::StakeAmountMismatch => "stake_amount_mismatch",
            EngineError::DuplicateBet => "duplicate_bet",
            EngineError::InsufficientBalance => "insufficient_balance",
            EngineError::NotSettleable => "not_settleable",
            EngineError::MarketNotFound => "market_not_found",
            EngineError::InvalidMarket(_) => "invalid_market",
            EngineError::InvalidDeposit(_) => "invalid_deposit",
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::Storage(_) => "storage_error",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Storage(err.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(err.into())
    }
}
