//! Parser module for the exchange realtime websocket
//!
//! The feed is table oriented: every data frame names a table and an action
//! (`partial`, `insert`, `update`, `delete`) applied to a list of rows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::trades::{Side, Trade};

/// Action carried by a table frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Full image of the table, sent once after subscribing
    Partial,
    Insert,
    Update,
    Delete,
}

/// Data frame for one table
#[derive(Debug, Clone, Deserialize)]
pub struct TableMessage {
    pub table: String,
    pub action: Action,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

/// Row of the `trade` table
#[derive(Debug, Clone, Deserialize)]
pub struct TradeRow {
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub size: u64,
    pub price: Decimal,
    #[serde(rename = "trdMatchID")]
    pub match_id: String,
}

impl From<TradeRow> for Trade {
    fn from(row: TradeRow) -> Self {
        Trade::new(row.match_id, row.timestamp, row.side, row.price, row.size)
    }
}

/// Row of an L2 order book table; updates and deletes omit price and size
#[derive(Debug, Clone, Deserialize)]
pub struct BookRow {
    pub id: u64,
    pub side: Side,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub price: Option<Decimal>,
}

/// Row of the `instrument` table; only the fields the watcher reads
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentRow {
    pub symbol: String,
    #[serde(default)]
    pub state: Option<String>,
}

/// Subscription acknowledgement
#[derive(Debug, Clone, Deserialize)]
struct SubscribeAck {
    success: bool,
    subscribe: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorMessage {
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct InfoMessage {
    info: String,
}

/// Parsed websocket message
#[derive(Debug, Clone)]
pub enum FeedMessage {
    Table(TableMessage),
    Subscribed(String),
    Info(String),
    Error(String),
    Unknown(String),
}

impl FeedMessage {
    /// Parse a raw websocket text frame
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(raw)?;

        if value.get("table").is_some() {
            return Ok(FeedMessage::Table(serde_json::from_value(value)?));
        }

        if value.get("subscribe").is_some() {
            let ack: SubscribeAck = serde_json::from_value(value)?;
            return Ok(if ack.success {
                FeedMessage::Subscribed(ack.subscribe)
            } else {
                FeedMessage::Error(format!("Subscription to {} rejected", ack.subscribe))
            });
        }

        if value.get("error").is_some() {
            let err: ErrorMessage = serde_json::from_value(value)?;
            return Ok(FeedMessage::Error(err.error));
        }

        if value.get("info").is_some() {
            let info: InfoMessage = serde_json::from_value(value)?;
            return Ok(FeedMessage::Info(info.info));
        }

        Ok(FeedMessage::Unknown(raw.to_string()))
    }
}

/// Decode the rows of a table frame into `T`
pub fn parse_rows<T: DeserializeOwned>(data: &[serde_json::Value]) -> Result<Vec<T>, serde_json::Error> {
    data.iter().cloned().map(serde_json::from_value).collect()
}
