//! Runtime configuration loaded from environment variables.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    /// Seconds between expiry sweep ticks.
    pub expiry_sweep_secs: u64,
    /// Capacity of the domain event broadcast channel.
    pub event_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./matchpool.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let expiry_sweep_secs = std::env::var("EXPIRY_SWEEP_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(5);

        let event_capacity = std::env::var("EVENT_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(1000);

        Ok(Self {
            database_path,
            port,
            expiry_sweep_secs,
            event_capacity,
        })
    }
}
