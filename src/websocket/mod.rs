//! WebSocket module for the exchange feed
//!
//! [`MarketFeed`] is what the watcher reads from, [`FeedConnector`] opens new
//! feeds, and [`DualStreamClient`] keeps two of them alive and rotates them.

mod client;
mod manager;
mod tables;

pub use client::{BitmexConnection, BitmexConnector};
pub use manager::DualStreamClient;
pub use tables::FeedTables;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::Result;
use crate::orderbook::Level;
use crate::trades::Trade;

pub const INSTRUMENT_TABLE: &str = "instrument";
pub const TRADE_TABLE: &str = "trade";

/// Trading state of the watched instrument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketState {
    Open,
    Closed,
    Unrecognized(String),
}

impl MarketState {
    pub fn from_instrument_state(state: Option<&str>) -> Self {
        match state {
            Some("Open") => MarketState::Open,
            Some("Closed") => MarketState::Closed,
            Some(other) => MarketState::Unrecognized(other.to_string()),
            None => MarketState::Unrecognized("unknown".to_string()),
        }
    }

    /// Open and Closed are the states the watcher knows how to handle
    pub fn is_normal(&self) -> bool {
        matches!(self, MarketState::Open | MarketState::Closed)
    }
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketState::Open => write!(f, "Open"),
            MarketState::Closed => write!(f, "Closed"),
            MarketState::Unrecognized(state) => write!(f, "{}", state),
        }
    }
}

/// Live view of one upstream connection
pub trait MarketFeed: Send + Sync + 'static {
    fn market_state(&self) -> MarketState;

    fn is_market_in_normal_state(&self) -> bool {
        self.market_state().is_normal()
    }

    /// Recent trades sorted ascending by `(timestamp, match id)`
    fn sorted_recent_trades(&self) -> Vec<Trade>;

    /// Bids sorted descending and asks sorted ascending by price
    fn sorted_bids_and_asks(&self) -> (Vec<Level>, Vec<Level>);

    /// When `table` last received data on this connection
    fn last_update(&self, table: &str) -> Option<DateTime<Utc>>;

    fn close(&self) -> Result<()>;
}

/// Opens new feed connections with a fixed subscription
#[async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    type Feed: MarketFeed;

    async fn connect(&self) -> Result<Self::Feed>;
}
