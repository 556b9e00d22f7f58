//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use saga::{EngineConfig, RecoveryConfig};

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string; unset means in-memory storage
/// - `SAGA_MAX_STEP_ATTEMPTS`: forward dispatches per step (default: `3`)
/// - `SAGA_MAX_COMPENSATION_ATTEMPTS`: undo dispatches per step (default: `10`)
/// - `SAGA_WORKER_SHARDS`: event queues and worker tasks (default: `8`)
/// - `SAGA_RECOVERY_INTERVAL_SECS`: stuck-saga sweep period (default: `30`)
/// - `SAGA_STUCK_TIMEOUT_SECS`: idle time before a saga is expired (default: `300`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub max_step_attempts: u32,
    pub max_compensation_attempts: u32,
    pub worker_shards: usize,
    pub recovery_interval_secs: u64,
    pub stuck_timeout_secs: u64,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    ///
    /// Values that fail to parse are ignored in favor of the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            max_step_attempts: env_or("SAGA_MAX_STEP_ATTEMPTS", defaults.max_step_attempts),
            max_compensation_attempts: env_or(
                "SAGA_MAX_COMPENSATION_ATTEMPTS",
                defaults.max_compensation_attempts,
            ),
            worker_shards: env_or("SAGA_WORKER_SHARDS", defaults.worker_shards),
            recovery_interval_secs: env_or(
                "SAGA_RECOVERY_INTERVAL_SECS",
                defaults.recovery_interval_secs,
            ),
            stuck_timeout_secs: env_or("SAGA_STUCK_TIMEOUT_SECS", defaults.stuck_timeout_secs),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_step_attempts: self.max_step_attempts,
            max_compensation_attempts: self.max_compensation_attempts,
            ..Default::default()
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            interval: Duration::from_secs(self.recovery_interval_secs),
            stuck_timeout: Duration::from_secs(self.stuck_timeout_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            max_step_attempts: 3,
            max_compensation_attempts: 10,
            worker_shards: 8,
            recovery_interval_secs: 30,
            stuck_timeout_secs: 300,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}
