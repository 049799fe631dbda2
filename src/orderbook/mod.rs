//! Order book module
//!
//! Turns raw bid/ask levels into immutable, content-addressed snapshots.

mod metrics;
mod snapshot;

pub use metrics::DepthMetrics;
pub use snapshot::{OrderBookSnapshot, BOARD_PRICE_INTERVAL};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single level in the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub size: u64,
}

impl Level {
    pub fn new(price: Decimal, size: u64) -> Self {
        Self { price, size }
    }
}

/// Round to the four decimal places every derived price and ratio is reported with.
///
/// Trailing zeros are dropped so `100.250` and `100.25` print and hash alike.
pub(crate) fn round4(value: Decimal) -> Decimal {
    value.round_dp(4).normalize()
}
