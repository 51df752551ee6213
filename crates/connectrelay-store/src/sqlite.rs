//! SQLite-backed durable store. Survives relay restarts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::kv::{ChangeNotifier, KeyValueStore};
use crate::schema::SCHEMA_SQL;
use crate::types::{PersistedState, StorageChange, StorageKey};
use connectrelay_core::{Error, Result};

pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    notifier: ChangeNotifier,
}

impl SqliteStore {
    /// Open or create the store.
    ///
    /// `db_dir` is the directory (e.g., `data/store/`). The file will be `db_dir/relay.db`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::Storage(e.to_string()))?;
        let db_path = db_dir.join("relay.db");

        let conn = Self::create_connection(&db_path)?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
            notifier: ChangeNotifier::new(),
        };

        info!(
            "SqliteStore initialized: {} keys, path={}",
            store.count_keys()?,
            store.db_path.display()
        );

        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Count persisted keys.
    pub fn count_keys(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM kv_entries", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))
    }

    fn read_value(conn: &Connection, key: StorageKey) -> Result<Option<Value>> {
        let raw: Option<String> = conn
            .prepare_cached("SELECT value_json FROM kv_entries WHERE key = ?1")
            .map_err(|e| Error::Database(e.to_string()))?
            .query_row(params![key.name()], |row| row.get(0))
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        raw.map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| Error::Storage(format!("corrupt value for {}: {}", key, e)))
        })
        .transpose()
    }

    fn key_exists(conn: &Connection, key: StorageKey) -> Result<bool> {
        conn.prepare_cached("SELECT 1 FROM kv_entries WHERE key = ?1")
            .map_err(|e| Error::Database(e.to_string()))?
            .exists(params![key.name()])
            .map_err(|e| Error::Database(e.to_string()))
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, keys: &[StorageKey]) -> Result<PersistedState> {
        let found = {
            let conn = self.conn.lock();
            let mut found = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(value) = Self::read_value(&conn, *key)? {
                    found.push((*key, value));
                }
            }
            found
        };
        PersistedState::from_entries(found)
    }

    async fn set(&self, state: PersistedState) -> Result<()> {
        let updates = state.to_entries()?;
        if updates.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp_millis();

        let changes = {
            let mut conn = self.conn.lock();
            let tx = conn
                .transaction()
                .map_err(|e| Error::Database(e.to_string()))?;
            let mut changes = Vec::with_capacity(updates.len());
            for (key, value) in &updates {
                let had_old = Self::key_exists(&tx, *key)?;
                tx.prepare_cached(
                    "INSERT INTO kv_entries (key, value_json, updated_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, \
                     updated_at = excluded.updated_at",
                )
                .map_err(|e| Error::Database(e.to_string()))?
                .execute(params![key.name(), value.to_string(), now])
                .map_err(|e| Error::Database(e.to_string()))?;
                changes.push(StorageChange {
                    key: *key,
                    had_old,
                    has_new: true,
                });
            }
            tx.commit().map_err(|e| Error::Database(e.to_string()))?;
            changes
        };

        debug!("Stored {} keys", changes.len());
        self.notifier.publish(changes);
        Ok(())
    }

    async fn remove(&self, keys: &[StorageKey]) -> Result<()> {
        let changes = {
            let conn = self.conn.lock();
            let mut changes = Vec::with_capacity(keys.len());
            for key in keys {
                let count = conn
                    .execute("DELETE FROM kv_entries WHERE key = ?1", params![key.name()])
                    .map_err(|e| Error::Database(e.to_string()))?;
                changes.push(StorageChange {
                    key: *key,
                    had_old: count > 0,
                    has_new: false,
                });
            }
            changes
        };

        self.notifier.publish(changes);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.notifier.subscribe()
    }
}
