//! Market watcher run loop
//!
//! Every iteration persists the trades that are new since the cursor, takes an
//! order book snapshot and stores it only when its digest changed. A heartbeat
//! is published for unchanged books. The loop gives up, and tears everything
//! down, on a crossed book or once either idle counter exceeds its maximum.

use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::error::{Result, WatcherError};
use crate::metrics::WatcherMetrics;
use crate::orderbook::OrderBookSnapshot;
use crate::publisher::Notifier;
use crate::store::Store;
use crate::trades::{filter_new_trades, Trade, TradesCursor};
use crate::websocket::{DualStreamClient, FeedConnector, MarketFeed, MarketState, INSTRUMENT_TABLE, TRADE_TABLE};
use crate::{DATE_FORMAT, VERSION};

/// Published instead of a snapshot id when the order book did not change
pub const HEARTBEAT: &str = "*";

const MARKET_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Why the run loop stopped without an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Best ask at or below best bid
    CorruptedBook,
    OrdersIdle { count: u32 },
    TradesIdle { count: u32, feed_idle: bool },
    /// [`MarketWatcher::request_stop`] was called
    Stopped,
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::CorruptedBook => write!(f, "order book corrupted"),
            LoopExit::OrdersIdle { count } => {
                write!(f, "order book not updated for {} iterations", count)
            }
            LoopExit::TradesIdle { count, feed_idle } => write!(
                f,
                "trades not updated for {} iterations (feed idle: {})",
                count, feed_idle
            ),
            LoopExit::Stopped => write!(f, "stop requested"),
        }
    }
}

/// State carried from one iteration to the next
#[derive(Debug, Default)]
pub struct LoopState {
    pub cursor: Option<TradesCursor>,
    /// Digest of the last stored snapshot
    pub digest: Option<String>,
    pub orders_idle_count: u32,
    pub trades_idle_count: u32,
    pub loop_count: u64,
}

pub struct MarketWatcher<C: FeedConnector> {
    config: Arc<WatcherConfig>,
    feed: DualStreamClient<C>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<WatcherMetrics>,
    running: AtomicBool,
    stop: watch::Sender<bool>,
}

impl<C: FeedConnector> MarketWatcher<C> {
    /// Connect the feed, prepare the store and check the market state.
    ///
    /// Anything acquired so far is released again when a step fails.
    pub async fn start(
        config: Arc<WatcherConfig>,
        connector: C,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<WatcherMetrics>,
    ) -> Result<Self> {
        info!(
            version = VERSION,
            symbol = %config.symbol,
            book = %config.order_book_table,
            "Starting market watcher"
        );

        let feed = match DualStreamClient::connect(connector, config.ws_refresh_interval()).await {
            Ok(feed) => feed,
            Err(e) => {
                if let Err(close_err) = store.close().await {
                    warn!(error = %close_err, "Unable to close the store");
                }
                return Err(e);
            }
        };

        let (stop, _) = watch::channel(false);
        let watcher = Self {
            config,
            feed,
            store,
            notifier,
            metrics,
            running: AtomicBool::new(true),
            stop,
        };

        let prepared = async {
            watcher.store.ensure_schema().await?;
            watcher.sanity_check().await
        };
        if let Err(e) = prepared.await {
            error!(error = %e, "Market watcher failed to start");
            watcher.shutdown().await;
            return Err(e);
        }

        Ok(watcher)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the run loop to stop once the current iteration is complete
    pub fn request_stop(&self) {
        if !self.stop.send_replace(true) {
            info!("Stop requested, finishing the current iteration");
        }
    }

    fn is_stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sleep for `duration`; returns `true` when woken early by a stop request
    async fn pause(&self, duration: Duration) -> bool {
        let mut stop = self.stop.subscribe();
        tokio::select! {
            biased;
            _ = async { stop.wait_for(|stopped| *stopped).await.map(|_| ()) } => true,
            _ = sleep(duration) => false,
        }
    }

    /// Run until the loop aborts, fails or is asked to stop, then tear down
    pub async fn run_loop(&self) -> Result<LoopExit> {
        let result = self.watch().await;
        match &result {
            Ok(LoopExit::Stopped) => info!("Run loop stopped"),
            Ok(exit) => error!(reason = %exit, "Run loop aborted"),
            Err(e) => error!(error = %e, "Run loop failed"),
        }
        self.shutdown().await;
        result
    }

    async fn watch(&self) -> Result<LoopExit> {
        let mut state = LoopState {
            cursor: self.load_trades_cursor().await?,
            ..LoopState::default()
        };

        loop {
            if let Some(exit) = self.run_iteration(&mut state).await? {
                return Ok(exit);
            }
            if self.is_stop_requested() || self.pause(self.config.loop_interval()).await {
                return Ok(LoopExit::Stopped);
            }
        }
    }

    /// One pass of the loop; `Some` means the loop must stop
    pub async fn run_iteration(&self, state: &mut LoopState) -> Result<Option<LoopExit>> {
        let started = Instant::now();
        let loop_id = format!("{}_{}", Utc::now().format("%Y%m%d%H%M%S"), state.loop_count);
        state.loop_count += 1;
        info!(loop_id = %loop_id, version = VERSION, "Loop head");

        if self.wait_while_market_is_closed().await {
            return Ok(Some(LoopExit::Stopped));
        }
        self.sanity_check().await?;

        self.process_trades(state).await?;

        let snapshot = self.take_snapshot().await?;
        if !snapshot.is_healthy() {
            error!(
                loop_id = %loop_id,
                highest_bid = %snapshot.metrics().highest_bid,
                lowest_ask = %snapshot.metrics().lowest_ask,
                "Order book snapshot corrupted"
            );
            return Ok(Some(LoopExit::CorruptedBook));
        }
        self.process_snapshot(state, &snapshot).await?;

        self.metrics.orders_idle_count.set(i64::from(state.orders_idle_count));
        self.metrics.trades_idle_count.set(i64::from(state.trades_idle_count));

        if state.orders_idle_count > self.config.max_orders_idle_count {
            error!(idle_count = state.orders_idle_count, "Order book not updated, aborting");
            return Ok(Some(LoopExit::OrdersIdle {
                count: state.orders_idle_count,
            }));
        }
        if state.trades_idle_count > self.config.max_trades_idle_count {
            let feed_idle = self
                .is_feed_idle(TRADE_TABLE, self.config.max_trades_idle_count)
                .await;
            error!(
                idle_count = state.trades_idle_count,
                feed_idle,
                "Trades not updated, aborting"
            );
            return Ok(Some(LoopExit::TradesIdle {
                count: state.trades_idle_count,
                feed_idle,
            }));
        }

        self.metrics.loop_iterations.inc();
        info!(
            loop_id = %loop_id,
            elapsed_secs = %format_args!("{:.2}", started.elapsed().as_secs_f64()),
            orders_idle_count = state.orders_idle_count,
            trades_idle_count = state.trades_idle_count,
            "Loop summary"
        );
        Ok(None)
    }

    async fn process_trades(&self, state: &mut LoopState) -> Result<()> {
        let trades = self.feed.freshest(TRADE_TABLE).await.sorted_recent_trades();
        match (trades.first(), trades.last()) {
            (Some(first), Some(last)) => info!(
                count = trades.len(),
                first = %first.timestamp().format(DATE_FORMAT),
                last = %last.timestamp().format(DATE_FORMAT),
                "Trades fetched"
            ),
            _ => info!("No trades fetched from the market"),
        }

        let new_trades = filter_new_trades(state.cursor.as_ref(), &trades);
        let Some(last) = new_trades.last() else {
            state.trades_idle_count += 1;
            info!("No new trades");
            return Ok(());
        };

        let docs = new_trades
            .iter()
            .map(Trade::to_document)
            .collect::<Result<Vec<_>>>()?;
        let ids = self
            .store
            .insert_many(&self.config.trades_collection, docs)
            .await?;

        let cursor = TradesCursor::from_trade(last);
        info!(inserted = ids.len(), last = %cursor, "New trades inserted");
        self.save_trades_cursor(&cursor).await?;

        self.metrics.trades_inserted.inc_by(ids.len() as u64);
        state.cursor = Some(cursor);
        state.trades_idle_count = 0;
        Ok(())
    }

    async fn take_snapshot(&self) -> Result<OrderBookSnapshot> {
        let feed = self.feed.freshest(&self.config.order_book_table).await;
        let (bids, asks) = feed.sorted_bids_and_asks();
        let snapshot = OrderBookSnapshot::new(Utc::now(), bids, asks, self.config.accept_price_range_ratio)?;
        debug!(
            mid_price = %snapshot.metrics().mid_price,
            price_from_depth = %snapshot.metrics().price_from_depth,
            bids = snapshot.bids().len(),
            asks = snapshot.asks().len(),
            "Order book snapshot taken"
        );
        Ok(snapshot)
    }

    async fn process_snapshot(&self, state: &mut LoopState, snapshot: &OrderBookSnapshot) -> Result<()> {
        let channel = &self.config.order_book_snapshot_id_channel;
        let digest = snapshot.digest();

        if state.digest.as_deref() == Some(digest.as_str()) {
            state.orders_idle_count += 1;
            info!(digest = %digest, "Order book digest has not changed");
            self.notifier.publish(channel, HEARTBEAT).await?;
            self.metrics.heartbeats_published.inc();
            return Ok(());
        }

        state.orders_idle_count = 0;
        let id = self
            .store
            .insert_many(
                &self.config.order_book_snapshots_collection,
                vec![snapshot.to_document()?],
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| WatcherError::StoreError("No identifier returned for the snapshot".to_string()))?;
        info!(id = %id, "Order book snapshot inserted");
        self.metrics.snapshots_inserted.inc();

        self.notifier.publish(channel, &id).await?;
        info!(channel = %channel, id = %id, "Snapshot id published");
        state.digest = Some(digest);
        Ok(())
    }

    /// Poll once per second, up to `market_wait_secs`, while the market is closed.
    /// Returns `true` when a stop request cut the wait short.
    async fn wait_while_market_is_closed(&self) -> bool {
        let mut waited = 0;
        while waited < self.config.market_wait_secs {
            if self.feed.freshest(INSTRUMENT_TABLE).await.market_state() != MarketState::Closed {
                return false;
            }
            info!(waited_secs = waited, "Market is closed, waiting");
            if self.pause(MARKET_POLL_INTERVAL).await {
                return true;
            }
            waited += 1;
        }
        false
    }

    async fn sanity_check(&self) -> Result<()> {
        let feed = self.feed.freshest(INSTRUMENT_TABLE).await;
        if !feed.is_market_in_normal_state() {
            let state = feed.market_state();
            error!(state = %state, "Market is not in a normal state");
            return Err(WatcherError::MarketClosed {
                state: state.to_string(),
            });
        }
        Ok(())
    }

    /// A table is idle when it was never updated or its last update is older
    /// than half of `max_idle_count` loop intervals.
    pub async fn is_feed_idle(&self, table: &str, max_idle_count: u32) -> bool {
        let Some(last_update) = self.feed.freshest(table).await.last_update(table) else {
            return true;
        };
        let elapsed = (Utc::now() - last_update).num_milliseconds() as f64 / 1000.0;
        let threshold = f64::from(max_idle_count) / 2.0 * self.config.loop_interval_secs;
        warn!(table, elapsed_secs = elapsed, "Feed elapsed since last update");
        threshold < elapsed
    }

    async fn load_trades_cursor(&self) -> Result<Option<TradesCursor>> {
        match self.store.find_one(&self.config.trades_cursor_collection).await? {
            Some(doc) => {
                let cursor = TradesCursor::from_document(doc)?;
                info!(cursor = %cursor, "Trades cursor loaded");
                Ok(Some(cursor))
            }
            None => {
                info!("Trades cursor not found");
                Ok(None)
            }
        }
    }

    async fn save_trades_cursor(&self, cursor: &TradesCursor) -> Result<()> {
        self.store
            .replace_singleton(&self.config.trades_cursor_collection, cursor.to_document()?)
            .await?;
        debug!(cursor = %cursor, "Trades cursor saved");
        Ok(())
    }

    /// Release the store and the feed; only the first call does anything
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(version = VERSION, "Shutting down market watcher");

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Unable to close the store");
        }
        self.feed.close().await;
    }
}
