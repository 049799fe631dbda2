//! Benchmarks for snapshot construction and trade filtering

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use market_watcher::orderbook::{Level, OrderBookSnapshot};
use market_watcher::trades::{filter_new_trades, Side, Trade, TradesCursor};
use rust_decimal::Decimal;

/// 25 levels per side, 0.5 apart, around 3950
fn create_book(levels: i64) -> (Vec<Level>, Vec<Level>) {
    let bids = (0..levels)
        .map(|i| Level::new(Decimal::new(39500 - 5 * i, 1), (100 + i * 10) as u64))
        .collect();
    let asks = (0..levels)
        .map(|i| Level::new(Decimal::new(39505 + 5 * i, 1), (120 + i * 7) as u64))
        .collect();
    (bids, asks)
}

fn create_trades(count: i64) -> Vec<Trade> {
    let start = Utc.with_ymd_and_hms(2019, 3, 17, 12, 0, 0).unwrap();
    (0..count)
        .map(|i| {
            let side = if i % 2 == 0 { Side::Buy } else { Side::Sell };
            Trade::new(
                format!("{:08}", i),
                start + Duration::milliseconds(i * 10),
                side,
                Decimal::new(39500, 1),
                100,
            )
        })
        .collect()
}

fn benchmark_snapshot(c: &mut Criterion) {
    let (bids, asks) = create_book(25);
    let ratio = Decimal::new(5, 3);

    c.bench_function("snapshot_25_levels", |b| {
        b.iter(|| {
            OrderBookSnapshot::new(Utc::now(), black_box(bids.clone()), black_box(asks.clone()), ratio)
        })
    });

    let snapshot = OrderBookSnapshot::new(Utc::now(), bids, asks, ratio).unwrap();
    c.bench_function("snapshot_digest", |b| {
        b.iter(|| black_box(&snapshot).digest())
    });
}

fn benchmark_trade_filter(c: &mut Criterion) {
    let trades = create_trades(1000);
    let cursor = TradesCursor::from_trade(&trades[900]);

    c.bench_function("filter_new_trades_1000", |b| {
        b.iter(|| filter_new_trades(Some(black_box(&cursor)), black_box(&trades)).len())
    });
}

criterion_group!(benches, benchmark_snapshot, benchmark_trade_filter);
criterion_main!(benches);
