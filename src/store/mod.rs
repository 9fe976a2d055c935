//! Persistent per-user state in SQLite.
//!
//! Four tables mirror the key-value layout the bot has always used:
//! - `user_configurations` keyed by `user_id`
//! - `user_context` keyed by (`user_id`, `engine`), 60 day TTL
//! - `user_conversations` keyed by (`conversation_id`, `request_id`), 60 day TTL
//! - `request_jobs` keyed by (`request_id`, `engine`), 10 day TTL
//!
//! Expired rows are invisible to reads and removed by [`Database::purge_expired`].

mod blobs;
mod request_jobs;
mod user_config;
mod user_context;

pub use blobs::BlobStore;
pub use request_jobs::{JobContext, RequestJob};
pub use user_config::{ConversationStyle, UserConfig};
pub use user_context::{ConversationTurn, UserContext};

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, params};
use tracing::info;

/// Lifetime of conversation context rows.
pub const CONTEXT_RETENTION_SECS: i64 = 60 * 24 * 3600;
/// Lifetime of asynchronous job correlation rows.
pub const JOB_RETENTION_SECS: i64 = 10 * 24 * 3600;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("blob storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid blob key '{0}'")]
    InvalidKey(String),
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// SQLite-backed store shared by the gateway and every engine worker.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;
        info!("Opened database {:?}", path);
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS user_configurations (
                user_id INTEGER PRIMARY KEY,
                config TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_context (
                user_id TEXT NOT NULL,
                engine TEXT NOT NULL,
                conversation_id TEXT,
                parent_id TEXT,
                exp INTEGER NOT NULL,
                PRIMARY KEY (user_id, engine)
            );
            CREATE INDEX IF NOT EXISTS idx_user_context_conversation ON user_context(conversation_id);
            CREATE TABLE IF NOT EXISTS user_conversations (
                conversation_id TEXT NOT NULL,
                request_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                engine TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                conversation TEXT NOT NULL,
                exp INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, request_id)
            );
            CREATE TABLE IF NOT EXISTS request_jobs (
                request_id TEXT NOT NULL,
                engine TEXT NOT NULL,
                context TEXT,
                timestamp INTEGER NOT NULL,
                exp INTEGER NOT NULL,
                PRIMARY KEY (request_id, engine)
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database lock poisoned")
    }

    /// Delete every row whose expiry is at or before `now`.
    pub fn purge_expired(&self, now: i64) -> Result<usize, StoreError> {
        let conn = self.conn();
        let mut removed = 0;
        for table in ["user_context", "user_conversations", "request_jobs"] {
            removed += conn.execute(&format!("DELETE FROM {table} WHERE exp <= ?1"), params![now])?;
        }
        if removed > 0 {
            info!("Purged {} expired row(s)", removed);
        }
        Ok(removed)
    }
}
