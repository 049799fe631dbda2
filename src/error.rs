//! Error types for the market watcher

use thiserror::Error;

/// Market watcher errors
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Order book has no {side} levels within the accepted price range")]
    EmptyBook { side: &'static str },

    #[error("Market is not in a recognized state: {state}")]
    MarketClosed { state: String },

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Connection timeout")]
    ConnectionTimeout,
}

impl From<tokio_tungstenite::tungstenite::Error> for WatcherError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        WatcherError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for WatcherError {
    fn from(err: serde_json::Error) -> Self {
        WatcherError::ParseError(err.to_string())
    }
}

impl From<std::io::Error> for WatcherError {
    fn from(err: std::io::Error) -> Self {
        WatcherError::StoreError(err.to_string())
    }
}

impl From<rusqlite::Error> for WatcherError {
    fn from(err: rusqlite::Error) -> Self {
        WatcherError::StoreError(err.to_string())
    }
}

impl From<config::ConfigError> for WatcherError {
    fn from(err: config::ConfigError) -> Self {
        WatcherError::ConfigError(err.to_string())
    }
}

impl From<prometheus::Error> for WatcherError {
    fn from(err: prometheus::Error) -> Self {
        WatcherError::MetricsError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WatcherError>;
