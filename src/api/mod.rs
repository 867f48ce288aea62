//! HTTP surface: REST routes for markets, stakes, balances and settlement,
//! plus the WebSocket event feed.

pub mod routes;
pub mod ws;

pub use routes::{create_router, AppState};
