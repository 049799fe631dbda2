//! Market Watcher Library
//!
//! Watches one instrument of the exchange through two redundant websocket
//! connections, stores new trades and changed order book snapshots, and
//! notifies subscribers about every stored snapshot.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod orderbook;
pub mod parser;
pub mod publisher;
pub mod store;
pub mod trades;
pub mod watcher;
pub mod websocket;

#[cfg(test)]
mod testing;

pub use config::WatcherConfig;
pub use error::{Result, WatcherError};
pub use metrics::WatcherMetrics;
pub use orderbook::{DepthMetrics, Level, OrderBookSnapshot};
pub use publisher::{Notifier, Publisher};
pub use store::{SqliteStore, Store};
pub use trades::{filter_new_trades, Side, Trade, TradesCursor};
pub use watcher::{LoopExit, MarketWatcher};
pub use websocket::{BitmexConnector, DualStreamClient};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Timestamp format used in log lines
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
