//! Durable Key-Value Persistence Port
//!
//! The core only needs `get`/`set` by structured key. Records are JSON with
//! RFC 3339 timestamps; (de)serialization is owned by the stores, not the port.
//!
//! Two implementations ship with the crate:
//! - `InMemoryPersistence` for tests and ephemeral hosts
//! - `SqlitePersistence` backed by a single `kv` table

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{AgentError, Result};

/// Structured storage key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageKey {
    /// A single goal record
    Goal(String),
    /// A user's `AgentMemory`
    UserMemory(String),
    /// A user's suggestion list
    Suggestions(String),
    /// The learning-pattern table
    LearningPatterns,
    /// Decision log plus independence score
    DecisionLog,
}

impl StorageKey {
    /// Flat string form used by key-value backends
    pub fn as_key(&self) -> String {
        match self {
            StorageKey::Goal(id) => format!("goal:{}", id),
            StorageKey::UserMemory(user) => format!("memory:{}", user),
            StorageKey::Suggestions(user) => format!("suggestions:{}", user),
            StorageKey::LearningPatterns => "learning:patterns".to_string(),
            StorageKey::DecisionLog => "learning:decisions".to_string(),
        }
    }
}

/// Durable storage contract consumed by the core
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &StorageKey, value: Vec<u8>) -> Result<()>;
}

/// Read and deserialize a JSON record
pub async fn load_json<T: DeserializeOwned>(
    port: &dyn PersistencePort,
    key: &StorageKey,
) -> Result<Option<T>> {
    match port.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON record
pub async fn store_json<T: Serialize + ?Sized>(
    port: &dyn PersistencePort,
    key: &StorageKey,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    port.set(key, bytes).await
}

/// Process-local storage
#[derive(Default)]
pub struct InMemoryPersistence {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl PersistencePort for InMemoryPersistence {
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(&key.as_key()).cloned())
    }

    async fn set(&self, key: &StorageKey, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.as_key(), value);
        Ok(())
    }
}

/// SQLite-backed storage
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AgentError::PersistenceFailure(e.to_string()))?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;

        info!("Persistence opened: {}", path.display());
        Ok(store)
    }

    /// In-memory database (lost on drop)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AgentError::PersistenceFailure(format!("Lock error: {}", e)))
    }

    /// Number of stored records
    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl PersistencePort for SqlitePersistence {
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key.as_key()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &StorageKey, value: Vec<u8>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key.as_key(), value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }
}
