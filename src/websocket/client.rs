//! WebSocket client for the BitMEX realtime feed
//!
//! Each connection owns a listener task that keeps the subscribed tables up to
//! date; readers only ever take a short read lock on those tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::tables::FeedTables;
use super::{FeedConnector, MarketFeed, MarketState, INSTRUMENT_TABLE, TRADE_TABLE};
use crate::config::WatcherConfig;
use crate::error::{Result, WatcherError};
use crate::orderbook::Level;
use crate::parser::FeedMessage;
use crate::trades::Trade;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a new connection may take to deliver every partial image
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Opens subscribed connections to the realtime endpoint
#[derive(Debug, Clone)]
pub struct BitmexConnector {
    url: String,
    book_table: String,
    tables: Vec<String>,
}

impl BitmexConnector {
    pub fn new(config: &WatcherConfig) -> Self {
        let book_table = config.order_book_table.clone();
        let tables = vec![
            INSTRUMENT_TABLE.to_string(),
            book_table.clone(),
            TRADE_TABLE.to_string(),
        ];
        let topics: Vec<String> = tables
            .iter()
            .map(|t| format!("{}:{}", t, config.symbol))
            .collect();
        let url = format!("{}?subscribe={}", config.realtime_url(), topics.join(","));

        Self {
            url,
            book_table,
            tables,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FeedConnector for BitmexConnector {
    type Feed = BitmexConnection;

    async fn connect(&self) -> Result<BitmexConnection> {
        info!(url = %self.url, "Connecting to realtime feed");

        let (stream, response) = timeout(CONNECT_TIMEOUT, connect_async(&self.url))
            .await
            .map_err(|_| WatcherError::ConnectionTimeout)?
            .map_err(|e| WatcherError::WebSocketConnection(format!("Failed to connect: {}", e)))?;
        debug!(status = ?response.status(), "WebSocket handshake complete");

        let tables = Arc::new(RwLock::new(FeedTables::new(&self.book_table)));
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(listen(
            stream,
            tables.clone(),
            self.tables.clone(),
            ready_tx,
            shutdown_rx,
        ));

        let connection = BitmexConnection {
            tables,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task,
        };

        let ready = timeout(CONNECT_TIMEOUT, ready_rx.wait_for(|ready| *ready))
            .await
            .map(|received| received.map(|_| ()));

        let failure = match ready {
            Ok(Ok(())) => {
                info!("Realtime feed ready");
                return Ok(connection);
            }
            Ok(Err(_)) => WatcherError::WebSocketConnection(
                "Connection closed before every table was received".to_string(),
            ),
            Err(_) => WatcherError::ConnectionTimeout,
        };

        if let Err(e) = connection.close() {
            debug!(error = %e, "Failed to close connection that never became ready");
        }
        Err(failure)
    }
}

/// One live subscription
pub struct BitmexConnection {
    tables: Arc<RwLock<FeedTables>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: JoinHandle<()>,
}

impl BitmexConnection {
    fn read(&self) -> RwLockReadGuard<'_, FeedTables> {
        self.tables.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MarketFeed for BitmexConnection {
    fn market_state(&self) -> MarketState {
        self.read().market_state()
    }

    fn sorted_recent_trades(&self) -> Vec<Trade> {
        self.read().sorted_recent_trades()
    }

    fn sorted_bids_and_asks(&self) -> (Vec<Level>, Vec<Level>) {
        self.read().sorted_bids_and_asks()
    }

    fn last_update(&self, table: &str) -> Option<DateTime<Utc>> {
        self.read().last_update(table)
    }

    fn close(&self) -> Result<()> {
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| WatcherError::WebSocketConnection("Already closed".to_string()))?;

        sender
            .send(())
            .map_err(|_| WatcherError::WebSocketConnection("Listener already stopped".to_string()))
    }
}

impl Drop for BitmexConnection {
    fn drop(&mut self) {
        // A closed connection finishes on its own after sending the close frame.
        let open = self
            .shutdown
            .get_mut()
            .map(|sender| sender.is_some())
            .unwrap_or(true);
        if open {
            self.task.abort();
        }
    }
}

async fn listen(
    mut stream: WsStream,
    tables: Arc<RwLock<FeedTables>>,
    required: Vec<String>,
    ready: watch::Sender<bool>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ping = interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("Closing realtime feed");
                if let Err(e) = stream.close(None).await {
                    debug!(error = %e, "Close handshake failed");
                }
                break;
            }
            _ = ping.tick() => {
                if let Err(e) = stream.send(Message::Ping(Vec::new())).await {
                    warn!(error = %e, "Failed to send keepalive ping");
                    break;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&text, &tables);
                    if !*ready.borrow() && read_tables(&tables).has_partials(&required) {
                        ready.send_replace(true);
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = stream.send(Message::Pong(data)).await {
                        warn!(error = %e, "Failed to answer ping");
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!(frame = ?frame, "Received close frame");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "WebSocket error");
                    break;
                }
                None => {
                    warn!("WebSocket stream ended");
                    break;
                }
            }
        }
    }
}

fn handle_text(text: &str, tables: &RwLock<FeedTables>) {
    if text == "pong" {
        return;
    }

    match FeedMessage::parse(text) {
        Ok(FeedMessage::Table(message)) => {
            let mut guard = tables.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Err(e) = guard.apply(&message, Utc::now()) {
                warn!(table = %message.table, error = %e, "Failed to apply table frame");
            }
        }
        Ok(FeedMessage::Subscribed(topic)) => debug!(topic = %topic, "Subscribed"),
        Ok(FeedMessage::Info(info)) => info!(info = %info, "Feed info"),
        Ok(FeedMessage::Error(err)) => error!(error = %err, "Feed reported an error"),
        Ok(FeedMessage::Unknown(raw)) => debug!(raw = %raw, "Unknown message"),
        Err(e) => warn!(error = %e, "Failed to parse message"),
    }
}

fn read_tables(tables: &RwLock<FeedTables>) -> RwLockReadGuard<'_, FeedTables> {
    tables.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}
