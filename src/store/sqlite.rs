//! SQLite-backed store
//!
//! Every collection lives in one `documents` table ordered by an insertion
//! sequence. Capped collections keep a running byte total in `collections`
//! and drop their oldest rows inside the inserting transaction, so rows that
//! stay are never rewritten.

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::{CollectionSpec, Store};
use crate::config::WatcherConfig;
use crate::error::{Result, WatcherError};

const ID_FIELD: &str = "_id";
const TIMESTAMP_FIELD: &str = "timestamp";

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS documents (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    id TEXT NOT NULL UNIQUE,
    timestamp TEXT,
    size INTEGER NOT NULL,
    body TEXT NOT NULL
);

-- Oldest-first scans for find_one and eviction
CREATE INDEX IF NOT EXISTS idx_documents_collection_seq
    ON documents(collection, seq);

-- Time range queries over trades and snapshots
CREATE INDEX IF NOT EXISTS idx_documents_collection_timestamp
    ON documents(collection, timestamp);

CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    capped_bytes INTEGER,
    used_bytes INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;
"#;

pub struct SqliteStore {
    /// `None` once the store is closed
    conn: Arc<Mutex<Option<Connection>>>,
    location: String,
    capped: Vec<CollectionSpec>,
}

impl SqliteStore {
    /// Open or create the database file at `path`
    pub fn open(path: impl AsRef<Path>, capped: Vec<CollectionSpec>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|e| {
            WatcherError::StoreError(format!("Failed to open {}: {}", path.display(), e))
        })?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "Store opened");
        Ok(Self::with_connection(conn, path.display().to_string(), capped))
    }

    pub fn open_in_memory(capped: Vec<CollectionSpec>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::with_connection(conn, ":memory:".to_string(), capped))
    }

    pub fn from_config(config: &WatcherConfig) -> Result<Self> {
        Self::open(
            config.store_path(),
            vec![
                CollectionSpec::capped(&config.trades_collection, config.max_trades_collection_bytes),
                CollectionSpec::capped(
                    &config.order_book_snapshots_collection,
                    config.max_order_book_collection_bytes,
                ),
            ],
        )
    }

    fn with_connection(conn: Connection, location: String, capped: Vec<CollectionSpec>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            location,
            capped,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn cap_of(&self, collection: &str) -> Option<u64> {
        self.capped
            .iter()
            .find(|spec| spec.name == collection)
            .and_then(|spec| spec.capped_bytes)
    }

    /// Run `f` against the open connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let conn = guard
                .as_mut()
                .ok_or_else(|| WatcherError::StoreError("Store is closed".to_string()))?;
            f(conn)
        })
        .await
        .map_err(|e| WatcherError::StoreError(format!("Store task failed: {}", e)))?
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn ensure_schema(&self) -> Result<()> {
        let specs = self.capped.clone();
        let location = self.location.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut created = 0;
            for spec in &specs {
                let capped_bytes = spec.capped_bytes.map(clamp_to_i64);
                created += tx.execute(
                    "INSERT OR IGNORE INTO collections (name, capped_bytes) VALUES (?1, ?2)",
                    params![spec.name, capped_bytes],
                )?;
            }
            tx.commit()?;

            if created == 0 {
                debug!(location = %location, "Store schema already present");
            } else {
                info!(location = %location, collections = created, "Store schema created");
            }
            Ok(())
        })
        .await
    }

    async fn insert_many(&self, collection: &str, docs: Vec<serde_json::Value>) -> Result<Vec<String>> {
        let cap = self.cap_of(collection);
        let collection = collection.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut ids = Vec::with_capacity(docs.len());
            let mut added = 0i64;
            let mut newest = None;

            for mut doc in docs {
                let id = Uuid::now_v7().to_string();
                assign_id(&mut doc, &id)?;
                let (seq, size) = insert_document(&tx, &collection, &id, &doc)?;
                added += size;
                newest = Some(seq);
                ids.push(id);
            }

            if let (Some(cap), Some(newest)) = (cap, newest) {
                enforce_cap(&tx, &collection, clamp_to_i64(cap), added, newest)?;
            }
            tx.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn find_one(&self, collection: &str) -> Result<Option<serde_json::Value>> {
        let collection = collection.to_string();

        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM documents WHERE collection = ?1 ORDER BY seq LIMIT 1",
                    params![collection],
                    |row| row.get(0),
                )
                .optional()?;

            body.map(|body| {
                serde_json::from_str(&body).map_err(|e| {
                    WatcherError::StoreError(format!("Corrupted document in {}: {}", collection, e))
                })
            })
            .transpose()
        })
        .await
    }

    async fn replace_singleton(&self, collection: &str, mut doc: serde_json::Value) -> Result<()> {
        if doc.get(ID_FIELD).is_none() {
            assign_id(&mut doc, &Uuid::now_v7().to_string())?;
        }
        let id = doc
            .get(ID_FIELD)
            .map(|id| id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string()))
            .unwrap_or_default();
        let collection = collection.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM documents WHERE collection = ?1", params![collection])?;
            insert_document(&tx, &collection, &id, &doc)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.clone();
        let location = self.location.clone();

        tokio::task::spawn_blocking(move || {
            let taken = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
            match taken {
                Some(conn) => {
                    conn.close().map_err(|(_, e)| WatcherError::from(e))?;
                    debug!(location = %location, "Store closed");
                    Ok(())
                }
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| WatcherError::StoreError(format!("Store task failed: {}", e)))?
    }
}

/// Insert one document and return its sequence number and stored size
fn insert_document(
    tx: &Transaction<'_>,
    collection: &str,
    id: &str,
    doc: &serde_json::Value,
) -> Result<(i64, i64)> {
    let timestamp = doc
        .get(TIMESTAMP_FIELD)
        .and_then(|t| t.as_str())
        .map(str::to_string);
    let body = doc.to_string();
    let size = clamp_to_i64(body.len() as u64);

    tx.prepare_cached(
        "INSERT INTO documents (collection, id, timestamp, size, body) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?
    .execute(params![collection, id, timestamp, size, body])?;
    Ok((tx.last_insert_rowid(), size))
}

/// Account for `added` bytes and evict the oldest documents older than
/// `newest` until the collection fits `cap` again.
fn enforce_cap(tx: &Transaction<'_>, collection: &str, cap: i64, added: i64, newest: i64) -> Result<()> {
    let mut used: i64 = tx.query_row(
        "INSERT INTO collections (name, capped_bytes, used_bytes) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET used_bytes = used_bytes + excluded.used_bytes
         RETURNING used_bytes",
        params![collection, cap, added],
        |row| row.get(0),
    )?;

    let mut evicted = 0u32;
    let mut oldest_stmt = tx.prepare_cached(
        "SELECT seq, size FROM documents WHERE collection = ?1 AND seq < ?2 ORDER BY seq LIMIT 1",
    )?;
    while used > cap {
        let oldest: Option<(i64, i64)> = oldest_stmt
            .query_row(params![collection, newest], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let Some((seq, size)) = oldest else {
            break;
        };
        tx.execute("DELETE FROM documents WHERE seq = ?1", params![seq])?;
        used -= size;
        evicted += 1;
    }

    if evicted > 0 {
        tx.execute(
            "UPDATE collections SET used_bytes = ?2 WHERE name = ?1",
            params![collection, used],
        )?;
        debug!(collection, evicted, used_bytes = used, "Evicted documents from capped collection");
    }
    Ok(())
}

fn assign_id(doc: &mut serde_json::Value, id: &str) -> Result<()> {
    let object = doc
        .as_object_mut()
        .ok_or_else(|| WatcherError::StoreError("Documents must be JSON objects".to_string()))?;
    object.insert(ID_FIELD.to_string(), serde_json::Value::String(id.to_string()));
    Ok(())
}

fn clamp_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn store(cap: u64) -> SqliteStore {
        SqliteStore::open_in_memory(vec![CollectionSpec::capped("trades", cap)]).unwrap()
    }

    /// `(seq, _id)` of every stored document of `collection`, oldest first
    async fn rows(store: &SqliteStore, collection: &str) -> Vec<(i64, String)> {
        let collection = collection.to_string();
        store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare("SELECT seq, id FROM documents WHERE collection = ?1 ORDER BY seq")?;
                let rows = stmt
                    .query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .unwrap()
    }

    async fn used_bytes(store: &SqliteStore, collection: &str) -> (i64, i64) {
        let collection = collection.to_string();
        store
            .with_conn(move |conn| {
                let used = conn.query_row(
                    "SELECT used_bytes FROM collections WHERE name = ?1",
                    params![collection],
                    |row| row.get(0),
                )?;
                let stored = conn.query_row(
                    "SELECT COALESCE(SUM(size), 0) FROM documents WHERE collection = ?1",
                    params![collection],
                    |row| row.get(0),
                )?;
                Ok((used, stored))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent_and_persistent() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("db").join("bitmex_data.sqlite3");
        let capped = vec![CollectionSpec::capped("trades", 1024)];

        let store = SqliteStore::open(&path, capped.clone()).unwrap();
        store.ensure_schema().await.unwrap();
        store
            .insert_many("trades", vec![json!({"trdMatchID": "a"})])
            .await
            .unwrap();
        store.ensure_schema().await.unwrap();
        store.close().await.unwrap();

        // Existing documents survive a reopen and a second schema check.
        let store = SqliteStore::open(&path, capped).unwrap();
        store.ensure_schema().await.unwrap();
        let first = store.find_one("trades").await.unwrap().unwrap();
        assert_eq!(first["trdMatchID"], "a");

        let cap: Option<i64> = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT capped_bytes FROM collections WHERE name = 'trades'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(cap, Some(1024));
    }

    #[tokio::test]
    async fn test_insert_assigns_ids() {
        let store = store(1 << 20);

        let ids = store
            .insert_many("trades", vec![json!({"n": 1}), json!({"n": 2})])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        let first = store.find_one("trades").await.unwrap().unwrap();
        assert_eq!(first["_id"], ids[0].as_str());
        assert_eq!(first["n"], 1);
    }

    #[tokio::test]
    async fn test_capped_collection_evicts_oldest() {
        let store = store(200);
        store.ensure_schema().await.unwrap();

        let mut ids = Vec::new();
        for n in 0..10 {
            ids.extend(store.insert_many("trades", vec![json!({"n": n})]).await.unwrap());
        }

        let (used, stored) = used_bytes(&store, "trades").await;
        assert!(used <= 200);
        assert_eq!(used, stored);

        let kept = rows(&store, "trades").await;
        assert_eq!(kept.last().unwrap().1, ids[9]);
        let first = store.find_one("trades").await.unwrap().unwrap();
        assert!(first["n"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_eviction_leaves_retained_rows_untouched() {
        let store = store(300);
        store.ensure_schema().await.unwrap();
        for n in 0..20 {
            store.insert_many("trades", vec![json!({"n": n})]).await.unwrap();
        }
        let before = rows(&store, "trades").await;

        let new_ids = store.insert_many("trades", vec![json!({"n": 20})]).await.unwrap();
        let after = rows(&store, "trades").await;

        // Only the head was dropped; the survivors keep their sequence and id.
        let (survivors, appended) = after.split_at(after.len() - 1);
        assert!(before.ends_with(survivors));
        assert!(survivors.len() < before.len());
        assert_eq!(appended[0].1, new_ids[0]);
        assert!(appended[0].0 > before.last().unwrap().0);
    }

    #[tokio::test]
    async fn test_oversized_document_is_kept_alone() {
        let store = store(10);
        store
            .insert_many("trades", vec![json!({"n": 1}), json!({"n": 2})])
            .await
            .unwrap();

        let kept = rows(&store, "trades").await;
        assert_eq!(kept.len(), 1);
        assert_eq!(store.find_one("trades").await.unwrap().unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn test_replace_singleton_keeps_one_document() {
        let store = store(1024);

        assert!(store.find_one("trades_cursor").await.unwrap().is_none());

        store
            .replace_singleton("trades_cursor", json!({"trdMatchID": "a"}))
            .await
            .unwrap();
        store
            .replace_singleton("trades_cursor", json!({"trdMatchID": "b"}))
            .await
            .unwrap();

        assert_eq!(rows(&store, "trades_cursor").await.len(), 1);
        let doc = store.find_one("trades_cursor").await.unwrap().unwrap();
        assert_eq!(doc["trdMatchID"], "b");
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let store = store(1024);

        tokio_test::assert_ok!(store.close().await);
        tokio_test::assert_ok!(store.close().await);
        assert!(matches!(
            store.insert_many("trades", vec![json!({})]).await,
            Err(WatcherError::StoreError(_))
        ));
        assert!(store.find_one("trades").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_non_object_documents() {
        let store = store(1024);
        assert!(store.insert_many("trades", vec![json!(42)]).await.is_err());
        assert!(rows(&store, "trades").await.is_empty());
    }

    #[test]
    fn test_from_config_caps_the_capped_collections() {
        let tmp = tempdir().unwrap();
        let config = WatcherConfig {
            store_uri: format!("file://{}", tmp.path().display()),
            database: "bitmex_data".to_string(),
            ..Default::default()
        };
        let store = SqliteStore::from_config(&config).unwrap();

        assert_eq!(PathBuf::from(store.location()), config.store_path());
        assert!(tmp.path().join("bitmex_data.sqlite3").exists());
        assert_eq!(store.cap_of(&config.trades_collection), Some(100_000_000));
        assert_eq!(store.cap_of(&config.trades_cursor_collection), None);
    }
}
