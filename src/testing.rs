//! Scripted in-memory feed used by the unit tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Result, WatcherError};
use crate::orderbook::Level;
use crate::trades::Trade;
use crate::websocket::{FeedConnector, MarketFeed, MarketState};

/// Market data every scripted feed reports
#[derive(Debug, Clone)]
pub struct MarketScript {
    pub state: MarketState,
    pub trades: Vec<Trade>,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub last_updates: HashMap<String, DateTime<Utc>>,
}

impl Default for MarketScript {
    fn default() -> Self {
        Self {
            state: MarketState::Open,
            trades: Vec::new(),
            bids: Vec::new(),
            asks: Vec::new(),
            last_updates: HashMap::new(),
        }
    }
}

/// Test-side handle on one feed created by a [`ScriptedConnector`]
#[derive(Debug, Default)]
pub struct FeedHandle {
    last_updates: Mutex<HashMap<String, DateTime<Utc>>>,
    closed: AtomicBool,
    fail_close: AtomicBool,
}

impl FeedHandle {
    pub fn touch(&self, table: &str, at: DateTime<Utc>) {
        self.last_updates.lock().unwrap().insert(table.to_string(), at);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }
}

/// Every handle created so far, indexed by feed id
#[derive(Debug, Clone, Default)]
pub struct FeedHandles(Arc<Mutex<Vec<Arc<FeedHandle>>>>);

impl FeedHandles {
    pub fn get(&self, id: usize) -> Arc<FeedHandle> {
        self.0.lock().unwrap()[id].clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn push(&self, handle: Arc<FeedHandle>) -> usize {
        let mut handles = self.0.lock().unwrap();
        handles.push(handle);
        handles.len() - 1
    }
}

pub struct ScriptedFeed {
    id: usize,
    script: Arc<Mutex<MarketScript>>,
    handle: Arc<FeedHandle>,
}

impl ScriptedFeed {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl MarketFeed for ScriptedFeed {
    fn market_state(&self) -> MarketState {
        self.script.lock().unwrap().state.clone()
    }

    fn sorted_recent_trades(&self) -> Vec<Trade> {
        let mut trades = self.script.lock().unwrap().trades.clone();
        trades.sort();
        trades
    }

    fn sorted_bids_and_asks(&self) -> (Vec<Level>, Vec<Level>) {
        let script = self.script.lock().unwrap();
        (script.bids.clone(), script.asks.clone())
    }

    fn last_update(&self, table: &str) -> Option<DateTime<Utc>> {
        if let Some(at) = self.handle.last_updates.lock().unwrap().get(table) {
            return Some(*at);
        }
        self.script.lock().unwrap().last_updates.get(table).copied()
    }

    fn close(&self) -> Result<()> {
        if self.handle.fail_close.load(Ordering::SeqCst) {
            return Err(WatcherError::WebSocketConnection("scripted close failure".to_string()));
        }
        self.handle.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedConnector {
    script: Arc<Mutex<MarketScript>>,
    handles: FeedHandles,
    fail: Arc<AtomicBool>,
    fail_after: Option<usize>,
    connect_delay_ms: Arc<AtomicU64>,
}

impl ScriptedConnector {
    pub fn new(script: MarketScript) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            handles: FeedHandles::default(),
            fail: Arc::new(AtomicBool::new(false)),
            fail_after: None,
            connect_delay_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Refuse every connection after the first `count`
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn script(&self) -> Arc<Mutex<MarketScript>> {
        self.script.clone()
    }

    pub fn handles(&self) -> FeedHandles {
        self.handles.clone()
    }

    /// While set, every connection attempt fails
    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        self.fail.clone()
    }

    /// Milliseconds every connection attempt waits before completing
    pub fn delay_switch(&self) -> Arc<AtomicU64> {
        self.connect_delay_ms.clone()
    }
}

#[async_trait]
impl FeedConnector for ScriptedConnector {
    type Feed = ScriptedFeed;

    async fn connect(&self) -> Result<ScriptedFeed> {
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let exhausted = self.fail_after.map_or(false, |n| self.handles.len() >= n);
        if self.fail.load(Ordering::SeqCst) || exhausted {
            return Err(WatcherError::WebSocketConnection("scripted connect failure".to_string()));
        }

        let handle = Arc::new(FeedHandle::default());
        let id = self.handles.push(handle.clone());
        Ok(ScriptedFeed {
            id,
            script: self.script.clone(),
            handle,
        })
    }
}
