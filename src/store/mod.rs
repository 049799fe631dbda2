//! Persistent store for trades, the trade cursor and order book snapshots

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A collection the store must provide before the loop starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    /// Oldest documents are evicted once the collection grows past this size
    #[serde(rename = "cappedBytes")]
    pub capped_bytes: Option<u64>,
}

impl CollectionSpec {
    pub fn capped(name: &str, bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            capped_bytes: Some(bytes),
        }
    }
}

/// Document store used by the watcher
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Create the capped collections if they do not exist yet
    async fn ensure_schema(&self) -> Result<()>;

    /// Append `docs` in order and return the identifiers assigned to them
    async fn insert_many(&self, collection: &str, docs: Vec<serde_json::Value>) -> Result<Vec<String>>;

    async fn find_one(&self, collection: &str) -> Result<Option<serde_json::Value>>;

    /// Make `doc` the only document of `collection`
    async fn replace_singleton(&self, collection: &str, doc: serde_json::Value) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
