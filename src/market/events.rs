//! Domain events on an explicit broadcast channel.
//!
//! Subscribers (odds display, balance display, the /ws feed) consume these
//! instead of any ambient shared state. Lagging subscribers drop messages;
//! publishing never blocks the engine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::model::{Pool, SettlementKind};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    MarketCreated {
        market_id: String,
        question: String,
        options: Vec<String>,
        stake_amount: i64,
        expires_at: DateTime<Utc>,
    },
    StakePlaced {
        market_id: String,
        user_id: String,
        selected_option: String,
        stake_amount: i64,
        /// Fresh pool totals for live odds refresh.
        pools: Vec<Pool>,
    },
    MarketExpired {
        market_id: String,
    },
    MarketSettled {
        market_id: String,
        kind: SettlementKind,
        winning_option: Option<String>,
        total_pool: i64,
        total_paid: i64,
    },
    MarketVoided {
        market_id: String,
        total_pool: i64,
        refunded_count: usize,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MarketEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget; an empty subscriber set is not an error.
    pub fn publish(&self, event: MarketEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(16);
        bus.publish(MarketEvent::MarketExpired {
            market_id: "m1".to_string(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(MarketEvent::MarketExpired {
            market_id: "m1".to_string(),
        });

        match rx.recv().await.unwrap() {
            MarketEvent::MarketExpired { market_id } => assert_eq!(market_id, "m1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
