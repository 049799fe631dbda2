//! Immutable order book snapshot
//!
//! A snapshot keeps only the contiguous run of levels around the mid price that
//! falls inside the accepted band, derives [`DepthMetrics`] from them and exposes
//! a timestamp-independent content digest used for change detection.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{round4, DepthMetrics, Level};
use crate::error::{Result, WatcherError};

/// Width of one price bucket of the depth-weighted price (0.5)
pub const BOARD_PRICE_INTERVAL: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// Snapshot of the order book around the mid price
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookSnapshot {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    metrics: DepthMetrics,
    /// Bids sorted by price descending (best first)
    bids: Vec<Level>,
    /// Asks sorted by price ascending (best first)
    asks: Vec<Level>,
}

impl OrderBookSnapshot {
    /// Build a snapshot from raw levels in any order.
    ///
    /// `accept_price_range_ratio` must be positive; it is not checked here.
    pub fn new(
        timestamp: DateTime<Utc>,
        mut bids: Vec<Level>,
        mut asks: Vec<Level>,
        accept_price_range_ratio: Decimal,
    ) -> Result<Self> {
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        let best_bid = bids
            .first()
            .map(|l| l.price)
            .ok_or(WatcherError::EmptyBook { side: "bid" })?;
        let best_ask = asks
            .first()
            .map(|l| l.price)
            .ok_or(WatcherError::EmptyBook { side: "ask" })?;

        let mid_price = round4((best_bid + best_ask) / Decimal::from(2));
        let max_distance = mid_price * accept_price_range_ratio;

        truncate_to_band(&mut bids, mid_price, max_distance);
        truncate_to_band(&mut asks, mid_price, max_distance);

        let metrics = DepthMetrics::compute(&bids, &asks, mid_price, accept_price_range_ratio)?;

        Ok(Self {
            timestamp,
            metrics,
            bids,
            asks,
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metrics(&self) -> &DepthMetrics {
        &self.metrics
    }

    pub fn bids(&self) -> &[Level] {
        &self.bids
    }

    pub fn asks(&self) -> &[Level] {
        &self.asks
    }

    pub fn is_healthy(&self) -> bool {
        self.metrics.is_healthy()
    }

    /// SHA-256 hex digest of the kept levels; the timestamp is not part of it
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();

        for level in &self.bids {
            hasher.update(level.price.normalize().to_string().as_bytes());
            hasher.update(b":");
            hasher.update(level.size.to_string().as_bytes());
            hasher.update(b"|");
        }
        hasher.update(b"---");

        for level in &self.asks {
            hasher.update(level.price.normalize().to_string().as_bytes());
            hasher.update(b":");
            hasher.update(level.size.to_string().as_bytes());
            hasher.update(b"|");
        }
        hasher.update(b"---");

        format!("{:x}", hasher.finalize())
    }

    /// Stored representation: summary fields next to the kept levels
    pub fn to_document(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| WatcherError::SerializationError(e.to_string()))
    }
}

/// Keep the leading levels within `max_distance` of mid, dropping everything from
/// the first level outside the band onward.
fn truncate_to_band(levels: &mut Vec<Level>, mid_price: Decimal, max_distance: Decimal) {
    let keep = levels
        .iter()
        .take_while(|l| (l.price - mid_price).abs() <= max_distance)
        .count();
    levels.truncate(keep);
}
