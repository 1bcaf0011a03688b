//! Configuration management for Cartwheel

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::error::{CartError, CartResult};
use crate::persist::{PersistOptions, ENVELOPE_VERSION};

/// Cart behavior toggles. Configuration, not persisted state.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CartConfig {
    /// Maximum number of distinct cart slots
    pub max_items: usize,
    /// Ask the UI adapter to reveal the cart after a successful add
    pub auto_show_on_add: bool,
    /// Page size for cart display and cleanup sweeps
    pub persist_page_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PersistConfig {
    /// Storage key namespace
    pub namespace: String,
    /// Envelope lifetime in hours; absent means never expires by time
    pub ttl_hours: Option<i64>,
    pub compression: bool,
    /// Keep live instances sharing a storage medium in sync
    pub cross_instance_sync: bool,
    /// Data directory for the file-backed store
    pub data_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the rental server JSON API
    pub base_url: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub cart: CartConfig,
    pub persist: PersistConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl CartConfig {
    /// Reject impossible toggles at construction time; steady-state
    /// operations never re-validate.
    pub fn validate(&self) -> CartResult<()> {
        if self.max_items == 0 {
            return Err(CartError::Configuration(
                "cart.max_items must be at least 1".to_string(),
            ));
        }
        if self.persist_page_size == 0 {
            return Err(CartError::Configuration(
                "cart.persist_page_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            // Start with default configuration
            .add_source(File::with_name("config/default").required(false))
            // Layer on the environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add environment variables (with prefix CARTWHEEL_)
            .add_source(
                Environment::with_prefix("CARTWHEEL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Envelope manager options derived from the persist and cart sections.
    pub fn persist_options(&self) -> PersistOptions {
        PersistOptions {
            namespace: self.persist.namespace.clone(),
            version: ENVELOPE_VERSION,
            ttl: self.persist.ttl_hours.map(chrono::Duration::hours),
            compression: self.persist.compression,
            cleanup_page_size: self.cart.persist_page_size,
        }
    }
}

impl Default for CartConfig {
    fn default() -> Self {
        Self {
            max_items: 50,
            auto_show_on_add: true,
            persist_page_size: 25,
        }
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            namespace: "rental-cart".to_string(),
            ttl_hours: Some(72),
            compression: true,
            cross_instance_sync: true,
            data_dir: "data/cart".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            timeout_seconds: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.cart.validate().is_ok());
        assert_eq!(config.persist_options().namespace, "rental-cart");
        assert_eq!(
            config.persist_options().ttl,
            Some(chrono::Duration::hours(72))
        );
    }

    #[test]
    fn zero_max_items_is_rejected() {
        let config = CartConfig {
            max_items: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let config = CartConfig {
            persist_page_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
