//! Application configuration module
//!
//! This module provides type-safe configuration loading from environment
//! variables using the `config` and `dotenvy` crates. Configuration is loaded
//! with the `CANVAS_BRIDGE` prefix and nested values use double underscores
//! as separators.
//!
//! # Example
//!
//! ```no_run
//! use canvas_bridge::config::AppConfig;
//!
//! let config = AppConfig::load().expect("Failed to load configuration");
//! config.validate().expect("Invalid configuration");
//!
//! println!("Broker listening on {}", config.server.socket_addr());
//! ```

mod broker;
mod error;
mod server;

pub use broker::BrokerConfig;
pub use error::{ConfigError, ValidationError};
pub use server::ServerConfig;

use serde::Deserialize;

/// Root application configuration
///
/// Every value carries a default, so the broker starts with no environment
/// at all and binds loopback on its standard port.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Listener configuration (bind host, port, message size)
    #[serde(default)]
    pub server: ServerConfig,

    /// Broker configuration (buffers, timers, payload caps)
    #[serde(default)]
    pub broker: BrokerConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// This function:
    /// 1. Loads `.env` file if present (for development)
    /// 2. Reads environment variables with `CANVAS_BRIDGE` prefix
    /// 3. Uses `__` (double underscore) to separate nested values
    ///
    /// # Environment Variable Format
    ///
    /// - `CANVAS_BRIDGE__SERVER__PORT=3055` -> `server.port = 3055`
    /// - `CANVAS_BRIDGE__BROKER__GRACE_PERIOD_MS=5000` -> `broker.grace_period_ms = 5000`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if values cannot be parsed into expected types.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("CANVAS_BRIDGE")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.server.validate()?;
        self.broker.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to ensure tests don't run in parallel (env vars are global)
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_load_with_empty_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let config = AppConfig::load().expect("defaults should load");
        assert_eq!(config.server.port, 3055);
        assert_eq!(config.broker.log_capacity, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_reads_nested_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::set_var("CANVAS_BRIDGE__SERVER__PORT", "4100");
        env::set_var("CANVAS_BRIDGE__BROKER__LOG_CAPACITY", "32");
        let result = AppConfig::load();
        env::remove_var("CANVAS_BRIDGE__SERVER__PORT");
        env::remove_var("CANVAS_BRIDGE__BROKER__LOG_CAPACITY");

        let config = result.expect("overridden config should load");
        assert_eq!(config.server.port, 4100);
        assert_eq!(config.broker.log_capacity, 32);
    }

    #[test]
    fn test_validate_surfaces_section_errors() {
        let config = AppConfig {
            broker: BrokerConfig {
                grace_period_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
