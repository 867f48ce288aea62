//! Expiry scheduler: periodic sweep flipping past-deadline markets from
//! active to expired.
//!
//! The sweep only gates settlement eligibility. Placement re-checks the
//! deadline inside its own transaction, so tick granularity never lets a
//! late bet through.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use crate::error::EngineError;

use super::events::{EventBus, MarketEvent};
use super::store::MarketDb;

#[derive(Clone)]
pub struct ExpiryScheduler {
    db: MarketDb,
    events: EventBus,
}

impl ExpiryScheduler {
    pub fn new(db: MarketDb, events: EventBus) -> Self {
        Self { db, events }
    }

    /// One sweep: flip everything due at `now`, return the flipped ids.
    /// Idempotent; a no-op when nothing is due.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<String>, EngineError> {
        let expired = self.db.expire_due(now).await?;
        for market_id in &expired {
            info!(market_id, "market expired");
            self.events.publish(MarketEvent::MarketExpired {
                market_id: market_id.clone(),
            });
        }
        Ok(expired)
    }
}

/// Drive the scheduler on a fixed period until the task is aborted.
pub fn spawn_expiry_sweep(scheduler: ExpiryScheduler, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = scheduler.tick(Utc::now()).await {
                warn!("expiry sweep failed: {e:#}");
            }
        }
    })
}
