//! Parimutuel market engine.
//!
//! Lifecycle: a market is created with a question, mutually exclusive
//! outcome options, a fixed stake size, and a deadline. Users place
//! equal-size stakes until the deadline; the expiry sweep flips the market
//! out of the betting set; an external resolver supplies the winning option
//! and settlement redistributes the pooled stakes to winners exactly once.

pub mod events;
pub mod expiry;
pub mod model;
pub mod odds;
pub mod placement;
pub mod settlement;
pub mod store;

pub use events::{EventBus, MarketEvent};
pub use expiry::{spawn_expiry_sweep, ExpiryScheduler};
pub use model::{
    Market, MarketStatus, Pool, SettlementKind, SettlementResult, Stake, StakeSettlement,
    StakeStatus, UserBalance,
};
pub use odds::{project, MarketView, PoolView};
pub use placement::StakePlacement;
pub use settlement::SettlementService;
pub use store::MarketDb;
