//! Configuration module for the market watcher
//!
//! Settings are layered: built-in defaults, then an optional settings file,
//! then `WATCHER_*` environment variables. The result is a single immutable
//! [`WatcherConfig`] that is built once at startup and handed to every component.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::{Result, WatcherError};

/// Environment variable naming an alternative settings file
pub const SETTINGS_PATH_VAR: &str = "WATCHER_SETTINGS";

const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_millis(1500);

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Exchange REST base URL; the realtime endpoint is derived from it
    pub base_url: String,

    /// Instrument to watch (e.g. "XBTUSD")
    pub symbol: String,

    /// Name of this watcher instance, reported by the health endpoint
    pub instance_name: String,

    /// Order book table to subscribe to
    pub order_book_table: String,

    /// Store location (`file://` prefix optional)
    pub store_uri: String,
    pub database: String,
    pub trades_collection: String,
    pub trades_cursor_collection: String,
    pub order_book_snapshots_collection: String,

    /// Byte caps of the capped collections
    pub max_trades_collection_bytes: u64,
    pub max_order_book_collection_bytes: u64,

    /// Unix socket of the notification broker
    pub publish_socket_path: String,

    /// Channel the snapshot ids (or the heartbeat sentinel) are published on
    pub order_book_snapshot_id_channel: String,

    /// Half-width of the accepted price band, relative to the mid price
    pub accept_price_range_ratio: Decimal,

    /// Sleep between two loop iterations, in seconds
    pub loop_interval_secs: f64,

    /// Idle iterations tolerated before the loop aborts
    pub max_orders_idle_count: u32,
    pub max_trades_idle_count: u32,

    /// Period of the websocket rotation, in seconds
    pub ws_refresh_interval_secs: u64,

    /// Upper bound of the wait for a closed market to reopen, in seconds
    pub market_wait_secs: u64,

    pub log_level: String,

    /// Log file path; empty disables file logging
    pub log_file: String,

    /// Port of the health check and metrics server
    pub health_port: u16,
}

impl WatcherConfig {
    /// Load configuration from defaults, the optional settings file and the environment
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings_path = env::var(SETTINGS_PATH_VAR).unwrap_or_else(|_| "watcher".to_string());

        let config: Self = config::Config::builder()
            .add_source(config::File::with_name(&settings_path).required(false))
            .add_source(config::Environment::with_prefix("WATCHER").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the run loop cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.accept_price_range_ratio <= Decimal::ZERO {
            return Err(WatcherError::ConfigError(format!(
                "accept_price_range_ratio must be positive, got {}",
                self.accept_price_range_ratio
            )));
        }
        match Duration::try_from_secs_f64(self.loop_interval_secs) {
            Ok(interval) if !interval.is_zero() => {}
            _ => {
                return Err(WatcherError::ConfigError(format!(
                    "loop_interval_secs must be a positive, finite number of seconds, got {}",
                    self.loop_interval_secs
                )))
            }
        }
        if self.ws_refresh_interval_secs == 0
            || Instant::now().checked_add(self.ws_refresh_interval()).is_none()
        {
            return Err(WatcherError::ConfigError(format!(
                "ws_refresh_interval_secs must be positive and schedulable, got {}",
                self.ws_refresh_interval_secs
            )));
        }
        if self.symbol.is_empty() {
            return Err(WatcherError::ConfigError("symbol must not be empty".to_string()));
        }
        Ok(())
    }

    /// Pause between iterations; settings that fail validation fall back to the default
    pub fn loop_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.loop_interval_secs)
            .unwrap_or(DEFAULT_LOOP_INTERVAL)
    }

    pub fn ws_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.ws_refresh_interval_secs)
    }

    /// Database file of the configured database, under the store root
    pub fn store_path(&self) -> PathBuf {
        let root = self
            .store_uri
            .strip_prefix("file://")
            .unwrap_or(&self.store_uri);
        PathBuf::from(root).join(format!("{}.sqlite3", self.database))
    }

    /// Realtime websocket endpoint derived from the REST base URL
    ///
    /// `https://www.bitmex.com/api/v1/` becomes `wss://www.bitmex.com/realtime`.
    pub fn realtime_url(&self) -> String {
        let (scheme, rest) = match self.base_url.split_once("://") {
            Some(("http", rest)) => ("ws", rest),
            Some((_, rest)) => ("wss", rest),
            None => ("wss", self.base_url.as_str()),
        };
        let host = rest.split('/').next().unwrap_or(rest);
        format!("{}://{}/realtime", scheme, host)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.bitmex.com/api/v1/".to_string(),
            symbol: "XBTUSD".to_string(),
            instance_name: "WATCHER_NODE".to_string(),
            order_book_table: "orderBookL2_25".to_string(),
            store_uri: "file://./data".to_string(),
            database: "bitmex_data".to_string(),
            trades_collection: "trades".to_string(),
            trades_cursor_collection: "trades_cursor".to_string(),
            order_book_snapshots_collection: "order_book_snapshots".to_string(),
            max_trades_collection_bytes: 100_000_000,
            max_order_book_collection_bytes: 100_000_000,
            publish_socket_path: "/tmp/market-watcher.sock".to_string(),
            order_book_snapshot_id_channel: "from-watcher:order-book-snapshot-id".to_string(),
            accept_price_range_ratio: Decimal::new(5, 3),
            loop_interval_secs: DEFAULT_LOOP_INTERVAL.as_secs_f64(),
            max_orders_idle_count: 5,
            max_trades_idle_count: 20,
            ws_refresh_interval_secs: 600,
            market_wait_secs: 60,
            log_level: "info".to_string(),
            log_file: String::new(),
            health_port: 9090,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_are_valid() {
        let config = WatcherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.accept_price_range_ratio, dec!(0.005));
        assert_eq!(config.loop_interval(), Duration::from_millis(1500));
    }

    #[test]
    fn test_validate_rejects_non_positive_ratio() {
        let config = WatcherConfig {
            accept_price_range_ratio: Decimal::ZERO,
            ..WatcherConfig::default()
        };
        assert!(matches!(config.validate(), Err(WatcherError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let config = WatcherConfig {
            loop_interval_secs: 0.0,
            ..WatcherConfig::default()
        };
        assert!(config.validate().is_err());

        let config = WatcherConfig {
            ws_refresh_interval_secs: 0,
            ..WatcherConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unrepresentable_intervals() {
        for secs in [f64::INFINITY, f64::NAN, 1e300, -1.0] {
            let config = WatcherConfig {
                loop_interval_secs: secs,
                ..WatcherConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(WatcherError::ConfigError(_))),
                "accepted loop_interval_secs = {}",
                secs
            );
            assert_eq!(config.loop_interval(), Duration::from_millis(1500));
        }

        let config = WatcherConfig {
            ws_refresh_interval_secs: u64::MAX,
            ..WatcherConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_realtime_url() {
        let config = WatcherConfig::default();
        assert_eq!(config.realtime_url(), "wss://www.bitmex.com/realtime");

        let config = WatcherConfig {
            base_url: "http://localhost:8080/api/v1/".to_string(),
            ..WatcherConfig::default()
        };
        assert_eq!(config.realtime_url(), "ws://localhost:8080/realtime");
    }

    #[test]
    fn test_store_path_strips_scheme() {
        let config = WatcherConfig {
            store_uri: "file:///var/lib/watcher".to_string(),
            ..WatcherConfig::default()
        };
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/watcher/bitmex_data.sqlite3"));
    }

    #[test]
    fn test_partial_settings_fall_back_to_defaults() {
        let config: WatcherConfig = config::Config::builder()
            .set_override("symbol", "ETHUSD")
            .unwrap()
            .set_override("max_orders_idle_count", 7)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.symbol, "ETHUSD");
        assert_eq!(config.max_orders_idle_count, 7);
        assert_eq!(config.max_trades_idle_count, 20);
        assert_eq!(config.database, "bitmex_data");
    }
}
