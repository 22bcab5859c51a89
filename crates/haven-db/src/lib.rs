pub mod kv;
pub mod migrations;
pub mod models;
pub mod queries;

pub use kv::{Kv, KvError, MemKv, PrefixedKv};
pub use models::VersionedObject;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// SQLite-backed versioned key-value store.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, KvError> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrations::run(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database. Nothing survives a drop.
    pub fn open_in_memory() -> Result<Self, KvError> {
        let conn = Connection::open_in_memory()?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, KvError>
    where
        F: FnOnce(&Connection) -> Result<T, KvError>,
    {
        let conn = self.conn.lock().map_err(|_| KvError::LockPoisoned)?;
        f(&conn)
    }
}
