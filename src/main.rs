//! Matchpool - parimutuel betting engine for live-match micro-events.
//!
//! Serves the market/stake/settlement API, sweeps expired markets on an
//! interval, and streams domain events over WebSocket.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use matchpool_backend::api::{create_router, AppState};
use matchpool_backend::config::Config;
use matchpool_backend::market::{spawn_expiry_sweep, EventBus, ExpiryScheduler, MarketDb};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!("🎯 Matchpool engine starting");

    let db = MarketDb::new(&config.database_path)?;
    info!("📊 Database initialized at: {}", config.database_path);

    let events = EventBus::new(config.event_capacity);

    let scheduler = ExpiryScheduler::new(db.clone(), events.clone());
    spawn_expiry_sweep(scheduler, Duration::from_secs(config.expiry_sweep_secs));
    info!(
        "⏱️  Expiry sweep running every {}s",
        config.expiry_sweep_secs
    );

    let state = AppState::new(db, events);
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🚀 Listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "matchpool_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
