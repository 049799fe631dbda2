//! Executed trades and the persisted trade cursor
//!
//! Trades are ordered by `(timestamp, match id)`. The cursor remembers the last
//! trade already stored so a restart neither re-inserts nor skips trades.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Result, WatcherError};

/// Aggressor side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// One executed trade with its buy/sell volume split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    #[serde(rename = "trdMatchID")]
    match_id: String,
    timestamp: DateTime<Utc>,
    side: Side,
    #[serde(with = "rust_decimal::serde::float")]
    price: Decimal,
    size: u64,
    #[serde(rename = "boughtSize")]
    bought_size: u64,
    #[serde(rename = "soldSize")]
    sold_size: u64,
}

impl Trade {
    pub fn new(
        match_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        side: Side,
        price: Decimal,
        size: u64,
    ) -> Self {
        let (bought_size, sold_size) = match side {
            Side::Buy => (size, 0),
            Side::Sell => (0, size),
        };
        Self {
            match_id: match_id.into(),
            timestamp,
            side,
            price,
            size,
            bought_size,
            sold_size,
        }
    }

    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn bought_size(&self) -> u64 {
        self.bought_size
    }

    pub fn sold_size(&self) -> u64 {
        self.sold_size
    }

    pub fn to_document(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| WatcherError::SerializationError(e.to_string()))
    }

    fn key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, &self.match_id)
    }
}

impl PartialEq for Trade {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Trade {}

impl PartialOrd for Trade {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Trade {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {}@{} ({})",
            self.timestamp.format(crate::DATE_FORMAT),
            self.side,
            self.size,
            self.price,
            self.match_id
        )
    }
}

/// Marker of the last persisted trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradesCursor {
    timestamp: DateTime<Utc>,
    #[serde(rename = "trdMatchID")]
    match_id: String,
}

impl TradesCursor {
    pub fn new(timestamp: DateTime<Utc>, match_id: impl Into<String>) -> Self {
        Self {
            timestamp,
            match_id: match_id.into(),
        }
    }

    pub fn from_trade(trade: &Trade) -> Self {
        Self::new(trade.timestamp, trade.match_id.clone())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    /// True iff `trade` comes strictly after this cursor: timestamp first,
    /// match id breaking ties.
    pub fn is_behind_of(&self, trade: &Trade) -> bool {
        (self.timestamp, self.match_id.as_str()) < trade.key()
    }

    pub fn to_document(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| WatcherError::SerializationError(e.to_string()))
    }

    pub fn from_document(doc: serde_json::Value) -> Result<Self> {
        serde_json::from_value(doc).map_err(|e| WatcherError::SerializationError(e.to_string()))
    }
}

impl fmt::Display for TradesCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({} : {})",
            self.timestamp.format(crate::DATE_FORMAT),
            self.match_id
        )
    }
}

/// Trades strictly newer than `cursor`.
///
/// `trades` must already be sorted ascending by `(timestamp, match id)`; an
/// unsorted slice silently drops or repeats trades.
pub fn filter_new_trades<'a>(cursor: Option<&TradesCursor>, trades: &'a [Trade]) -> &'a [Trade] {
    match cursor {
        None => trades,
        Some(cursor) => {
            let start = trades
                .iter()
                .position(|t| cursor.is_behind_of(t))
                .unwrap_or(trades.len());
            &trades[start..]
        }
    }
}
