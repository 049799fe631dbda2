//! Order book metrics calculation

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{round4, Level, BOARD_PRICE_INTERVAL};
use crate::error::{Result, WatcherError};

/// Summary statistics of the levels kept in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthMetrics {
    /// Average of best bid and best ask, rounded to four places
    #[serde(with = "rust_decimal::serde::float")]
    pub mid_price: Decimal,

    /// Depth-weighted synthetic price
    #[serde(with = "rust_decimal::serde::float")]
    pub price_from_depth: Decimal,

    /// `price_from_depth - mid_price`
    #[serde(with = "rust_decimal::serde::float")]
    pub depth_bias: Decimal,

    /// `bids_volume / total_volume`, or -1 for an empty book
    #[serde(with = "rust_decimal::serde::float")]
    pub bids_ratio: Decimal,

    pub total_volume: u64,

    #[serde(with = "rust_decimal::serde::float")]
    pub highest_bid: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub lowest_bid: Decimal,
    pub bids_volume: u64,

    #[serde(with = "rust_decimal::serde::float")]
    pub lowest_ask: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub highest_ask: Decimal,
    pub asks_volume: u64,
}

impl DepthMetrics {
    /// Compute metrics from levels already sorted best-first and truncated to the price band
    pub fn compute(
        bids: &[Level],
        asks: &[Level],
        mid_price: Decimal,
        accept_price_range_ratio: Decimal,
    ) -> Result<Self> {
        let (highest_bid, lowest_bid) = match (bids.first(), bids.last()) {
            (Some(first), Some(last)) => (first.price, last.price),
            _ => return Err(WatcherError::EmptyBook { side: "bid" }),
        };
        let (lowest_ask, highest_ask) = match (asks.first(), asks.last()) {
            (Some(first), Some(last)) => (first.price, last.price),
            _ => return Err(WatcherError::EmptyBook { side: "ask" }),
        };

        let bids_volume: u64 = bids.iter().map(|l| l.size).sum();
        let asks_volume: u64 = asks.iter().map(|l| l.size).sum();
        let total_volume = bids_volume + asks_volume;

        let bids_ratio = if total_volume > 0 {
            round4(Decimal::from(bids_volume) / Decimal::from(total_volume))
        } else {
            Decimal::NEGATIVE_ONE
        };

        let price_from_depth = price_from_depth(bids, asks, mid_price, accept_price_range_ratio);

        Ok(Self {
            mid_price,
            price_from_depth,
            depth_bias: round4(price_from_depth - mid_price),
            bids_ratio,
            total_volume,
            highest_bid,
            lowest_bid,
            bids_volume,
            lowest_ask,
            highest_ask,
            asks_volume,
        })
    }

    /// A book is healthy while its best ask stays strictly above its best bid
    pub fn is_healthy(&self) -> bool {
        self.lowest_ask > self.highest_bid
    }
}

/// Depth-weighted synthetic price.
///
/// Buckets of width [`BOARD_PRICE_INTERVAL`] cover a band of half-width
/// `INTERVAL / 2 + mid * ratio` around the mid price. Both sides are walked in
/// lockstep from the best level outward, one level per bucket. Every bid is
/// mirrored to the ask side (and every ask to the bid side) at the bucket that
/// is as far from the band edge as the level is from mid, so large resting size
/// near the top of the book pulls the price hardest.
fn price_from_depth(bids: &[Level], asks: &[Level], mid_price: Decimal, ratio: Decimal) -> Decimal {
    let half_interval = BOARD_PRICE_INTERVAL / Decimal::from(2);
    let band_half_width = half_interval + mid_price * ratio;
    let num_buckets = (band_half_width / BOARD_PRICE_INTERVAL)
        .floor()
        .to_usize()
        .unwrap_or(0);

    let mut accumulated = Decimal::ZERO;
    let mut accumulated_volume: u64 = 0;

    for i in 0..num_buckets {
        let outermost = Decimal::from(num_buckets - 1);

        if let Some(bid) = bids.get(i) {
            let idx = ((mid_price - bid.price) / BOARD_PRICE_INTERVAL).floor();
            let reflected = mid_price + half_interval + (outermost - idx) * BOARD_PRICE_INTERVAL;
            accumulated += reflected * Decimal::from(bid.size);
            accumulated_volume += bid.size;
        }

        if let Some(ask) = asks.get(i) {
            let idx = ((ask.price - mid_price) / BOARD_PRICE_INTERVAL).floor();
            let reflected = mid_price - half_interval - (outermost - idx) * BOARD_PRICE_INTERVAL;
            accumulated += reflected * Decimal::from(ask.size);
            accumulated_volume += ask.size;
        }
    }

    if accumulated_volume > 0 {
        round4(accumulated / Decimal::from(accumulated_volume))
    } else {
        mid_price
    }
}
