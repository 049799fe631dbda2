//! Dual connection manager
//!
//! Keeps two redundant feeds, reads from whichever saw the latest data and
//! periodically replaces one of them so both never go stale together.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use super::{FeedConnector, MarketFeed};
use crate::error::{Result, WatcherError};

struct Shared<C: FeedConnector> {
    connector: C,
    slots: [Mutex<Arc<C::Feed>>; 2],
    /// Slot replaced by the most recent refresh attempt
    last_refreshed: AtomicUsize,
    /// Held for a whole refresh so at most one slot is ever being replaced
    refresh_guard: Mutex<()>,
    running: AtomicBool,
}

impl<C: FeedConnector> Shared<C> {
    async fn refresh(&self) -> Result<usize> {
        let _refreshing = self.refresh_guard.lock().await;
        let target = 1 - self.last_refreshed.load(Ordering::SeqCst);
        // Flipped even when the attempt fails so the next tick tries the other slot.
        self.last_refreshed.store(target, Ordering::SeqCst);

        let mut slot = self.slots[target].lock().await;
        let fresh = Arc::new(self.connector.connect().await?);

        if !self.running.load(Ordering::SeqCst) {
            if let Err(e) = fresh.close() {
                debug!(slot = target, error = %e, "Failed to close connection opened during shutdown");
            }
            return Err(WatcherError::WebSocketConnection(
                "Client closed during refresh".to_string(),
            ));
        }

        let previous = std::mem::replace(&mut *slot, fresh);
        drop(slot);

        if let Err(e) = previous.close() {
            warn!(slot = target, error = %e, "Failed to close replaced connection");
        }
        Ok(target)
    }
}

/// Two live feeds behind per-slot locks plus the background refresher
pub struct DualStreamClient<C: FeedConnector> {
    shared: Arc<Shared<C>>,
    refresher: StdMutex<Option<JoinHandle<()>>>,
}

impl<C: FeedConnector> DualStreamClient<C> {
    /// Open both connections and start rotating them every `refresh_interval`
    pub async fn connect(connector: C, refresh_interval: Duration) -> Result<Self> {
        let first = connector.connect().await?;
        let second = match connector.connect().await {
            Ok(feed) => feed,
            Err(e) => {
                if let Err(close_err) = first.close() {
                    warn!(error = %close_err, "Failed to close first connection");
                }
                return Err(e);
            }
        };

        let shared = Arc::new(Shared {
            connector,
            slots: [Mutex::new(Arc::new(first)), Mutex::new(Arc::new(second))],
            last_refreshed: AtomicUsize::new(0),
            refresh_guard: Mutex::new(()),
            running: AtomicBool::new(true),
        });

        let refresher = tokio::spawn(refresh_loop(shared.clone(), refresh_interval));
        info!(
            refresh_secs = refresh_interval.as_secs(),
            "Dual stream client connected"
        );

        Ok(Self {
            shared,
            refresher: StdMutex::new(Some(refresher)),
        })
    }

    /// The connection that most recently received data for `table`.
    ///
    /// A slot that is being replaced is skipped in favour of the other one.
    /// When neither connection has seen `table`, slot 0 is returned.
    pub async fn freshest(&self, table: &str) -> Arc<C::Feed> {
        let first = match self.shared.slots[0].try_lock() {
            Ok(guard) => guard,
            Err(_) => return self.shared.slots[1].lock().await.clone(),
        };
        let second = match self.shared.slots[1].try_lock() {
            Ok(guard) => guard,
            Err(_) => return first.clone(),
        };

        match (first.last_update(table), second.last_update(table)) {
            (Some(a), Some(b)) if b > a => second.clone(),
            (None, Some(_)) => second.clone(),
            _ => first.clone(),
        }
    }

    /// Replace the slot that was not replaced last time; returns its index
    pub async fn refresh(&self) -> Result<usize> {
        self.shared.refresh().await
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop the refresher and close both connections, logging failures
    pub async fn close(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.take_refresher() {
            task.abort();
        }

        for (index, slot) in self.shared.slots.iter().enumerate() {
            let feed = slot.lock().await;
            match feed.close() {
                Ok(()) => debug!(slot = index, "Connection closed"),
                Err(e) => warn!(slot = index, error = %e, "Failed to close connection"),
            }
        }
    }

    fn take_refresher(&self) -> Option<JoinHandle<()>> {
        self.refresher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl<C: FeedConnector> Drop for DualStreamClient<C> {
    fn drop(&mut self) {
        if let Some(task) = self.take_refresher() {
            task.abort();
        }
    }
}

async fn refresh_loop<C: FeedConnector>(shared: Arc<Shared<C>>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        match shared.refresh().await {
            Ok(slot) => info!(slot, "Websocket connection refreshed"),
            Err(e) => warn!(error = %e, "Websocket refresh failed, keeping the previous connection"),
        }
    }
}
