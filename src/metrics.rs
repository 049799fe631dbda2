//! Prometheus metrics for the run loop

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::{Result, WatcherError};

/// Counters and gauges updated once per loop iteration
pub struct WatcherMetrics {
    registry: Registry,
    pub loop_iterations: IntCounter,
    pub trades_inserted: IntCounter,
    pub snapshots_inserted: IntCounter,
    pub heartbeats_published: IntCounter,
    pub orders_idle_count: IntGauge,
    pub trades_idle_count: IntGauge,
}

impl WatcherMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("market_watcher".to_string()), None)?;

        let loop_iterations = IntCounter::new("loop_iterations_total", "Completed loop iterations")?;
        let trades_inserted = IntCounter::new("trades_inserted_total", "Trades written to the store")?;
        let snapshots_inserted =
            IntCounter::new("snapshots_inserted_total", "Order book snapshots written to the store")?;
        let heartbeats_published =
            IntCounter::new("heartbeats_published_total", "Iterations with an unchanged order book")?;
        let orders_idle_count = IntGauge::new("orders_idle_count", "Consecutive unchanged order books")?;
        let trades_idle_count = IntGauge::new("trades_idle_count", "Consecutive iterations without new trades")?;

        registry.register(Box::new(loop_iterations.clone()))?;
        registry.register(Box::new(trades_inserted.clone()))?;
        registry.register(Box::new(snapshots_inserted.clone()))?;
        registry.register(Box::new(heartbeats_published.clone()))?;
        registry.register(Box::new(orders_idle_count.clone()))?;
        registry.register(Box::new(trades_idle_count.clone()))?;

        Ok(Self {
            registry,
            loop_iterations,
            trades_inserted,
            snapshots_inserted,
            heartbeats_published,
            orders_idle_count,
            trades_idle_count,
        })
    }

    /// Render every metric in the prometheus text format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| WatcherError::MetricsError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_prefixed_metrics() {
        let metrics = WatcherMetrics::new().unwrap();
        metrics.loop_iterations.inc();
        metrics.orders_idle_count.set(3);

        let text = metrics.encode().unwrap();
        assert!(text.contains("market_watcher_loop_iterations_total 1"));
        assert!(text.contains("market_watcher_orders_idle_count 3"));
    }

    #[test]
    fn test_instances_do_not_collide() {
        assert!(WatcherMetrics::new().is_ok());
        assert!(WatcherMetrics::new().is_ok());
    }
}
