//! Matchpool Backend Library
//!
//! Parimutuel prediction-market engine for live-match micro-events: market
//! lifecycle, stake placement against token balances, live odds, and
//! exactly-once settlement. Exposed as a library for the server binary and
//! the integration tests.

pub mod api;
pub mod balance;
pub mod config;
pub mod error;
pub mod market;
