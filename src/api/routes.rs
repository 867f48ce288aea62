use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::balance::BalanceStore;
use crate::error::EngineError;
use crate::market::{
    odds, EventBus, MarketDb, MarketEvent, MarketStatus, MarketView, SettlementResult,
    SettlementService, Stake, StakePlacement, UserBalance,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub markets: MarketDb,
    pub balances: BalanceStore,
    pub placement: StakePlacement,
    pub settlement: SettlementService,
    pub events: EventBus,
}

impl AppState {
    pub fn new(db: MarketDb, events: EventBus) -> Self {
        Self {
            balances: BalanceStore::sharing(&db),
            placement: StakePlacement::new(db.clone(), events.clone()),
            settlement: SettlementService::new(db.clone(), events.clone()),
            markets: db,
            events,
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/markets", post(create_market).get(list_markets))
        .route("/api/markets/:id", get(get_market))
        .route("/api/markets/:id/stakes", post(place_stake))
        .route("/api/markets/:id/stakes/:user_id", get(get_user_stake))
        .route("/api/markets/:id/settle", post(settle_market))
        .route("/api/users/:user_id/balance", get(get_balance))
        .route("/api/users/:user_id/deposit", post(deposit))
        .route("/ws", get(super::ws::ws_handler))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn create_market(
    State(state): State<AppState>,
    Json(req): Json<CreateMarketRequest>,
) -> Result<(StatusCode, Json<MarketView>), ApiError> {
    let market = state
        .markets
        .create_market(
            &req.question,
            &req.options,
            req.stake_amount,
            req.expires_at,
            Utc::now(),
        )
        .await?;

    state.events.publish(MarketEvent::MarketCreated {
        market_id: market.id.clone(),
        question: market.question.clone(),
        options: market.options.clone(),
        stake_amount: market.stake_amount,
        expires_at: market.expires_at,
    });

    let pools = state.markets.get_pools(&market.id).await?;
    Ok((StatusCode::CREATED, Json(odds::project(&market, &pools))))
}

async fn list_markets(
    State(state): State<AppState>,
    Query(params): Query<MarketQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match params.status.as_deref() {
        None => None,
        Some(s) => Some(
            MarketStatus::from_str(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status '{s}'")))?,
        ),
    };

    let markets = state.markets.list_markets(status).await?;
    let mut views = Vec::with_capacity(markets.len());
    for market in &markets {
        let pools = state.markets.get_pools(&market.id).await?;
        views.push(odds::project(market, &pools));
    }

    Ok(Json(json!({ "count": views.len(), "markets": views })))
}

/// Market plus pools and live odds (read-only projection).
async fn get_market(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> Result<Json<MarketView>, ApiError> {
    let market = state
        .markets
        .get_market(&market_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("market {market_id} not found")))?;
    let pools = state.markets.get_pools(&market.id).await?;
    Ok(Json(odds::project(&market, &pools)))
}

async fn place_stake(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
    Json(req): Json<PlaceStakeRequest>,
) -> Result<(StatusCode, Json<Stake>), ApiError> {
    let stake = state
        .placement
        .place(&market_id, &req.user_id, &req.option, req.stake_amount)
        .await?;
    Ok((StatusCode::CREATED, Json(stake)))
}

async fn get_user_stake(
    State(state): State<AppState>,
    Path((market_id, user_id)): Path<(String, String)>,
) -> Result<Json<Stake>, ApiError> {
    state
        .markets
        .get_user_stake(&market_id, &user_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no stake for user {user_id} on market {market_id}")))
}

async fn settle_market(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
    Json(req): Json<SettleRequest>,
) -> Result<Json<SettlementResult>, ApiError> {
    let result = state
        .settlement
        .settle(&market_id, req.winning_option.as_deref())
        .await?;
    Ok(Json(result))
}

async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserBalance>, ApiError> {
    Ok(Json(state.balances.get(&user_id).await?))
}

async fn deposit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<DepositRequest>,
) -> Result<Json<UserBalance>, ApiError> {
    let balance = state
        .balances
        .deposit(&user_id, req.amount, Utc::now())
        .await?;
    Ok(Json(balance))
}

// ===== Request Types =====

#[derive(Debug, Deserialize)]
struct CreateMarketRequest {
    question: String,
    options: Vec<String>,
    stake_amount: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct MarketQuery {
    /// Filter by lifecycle status ("active", "expired", "settled", "void")
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaceStakeRequest {
    user_id: String,
    option: String,
    stake_amount: i64,
}

#[derive(Debug, Deserialize)]
struct SettleRequest {
    /// Omit (or null) to void the market and refund every stake.
    winning_option: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DepositRequest {
    amount: i64,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    NotFound(String),
    BadRequest(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Engine(err) => {
                let status = match err {
                    EngineError::MarketNotOpen
                    | EngineError::DuplicateBet
                    | EngineError::NotSettleable => StatusCode::CONFLICT,
                    EngineError::InvalidOption
                    | EngineError::StakeAmountMismatch
                    | EngineError::InvalidMarket(_)
                    | EngineError::InvalidDeposit(_) => StatusCode::BAD_REQUEST,
                    EngineError::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
                    EngineError::MarketNotFound => StatusCode::NOT_FOUND,
                    EngineError::InvariantViolation(_) | EngineError::Storage(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!("engine error: {err:#}");
                    "Internal server error".to_string()
                } else {
                    err.to_string()
                };
                (status, err.code(), message)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
        };

        let body = Json(json!({
            "error": message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_status_mapping() {
        let cases = [
            (EngineError::MarketNotOpen, StatusCode::CONFLICT),
            (EngineError::DuplicateBet, StatusCode::CONFLICT),
            (EngineError::NotSettleable, StatusCode::CONFLICT),
            (EngineError::InvalidOption, StatusCode::BAD_REQUEST),
            (EngineError::StakeAmountMismatch, StatusCode::BAD_REQUEST),
            (EngineError::InsufficientBalance, StatusCode::PAYMENT_REQUIRED),
            (EngineError::MarketNotFound, StatusCode::NOT_FOUND),
        ];
        for (err, expected) in cases {
            let response = ApiError::Engine(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
