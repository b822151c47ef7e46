//! SQLite persistence for the mirror.
//!
//! Runtime defaults are conservative:
//! - `journal_mode = WAL` so readers never wait for the proactive loaders
//! - `busy_timeout = 5s` to ride out short lock contention
//!
//! One connection is shared by every table and the intern table; it lives
//! behind a mutex because scheduler worker threads write concurrently.

pub mod migrations;
pub mod schema;
mod strings;
mod table;

pub use strings::SqliteCompactor;
pub use table::SqliteTable;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Serialize, de::DeserializeOwned};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::StoreError;

/// Busy timeout used for mirror DB connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection shared by all tables of one database.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Open (or create) the mirror SQLite database, apply runtime pragmas,
/// and migrate the schema to the latest version.
///
/// # Errors
///
/// Returns an error if opening/configuring/migrating the database fails.
pub fn open_mirror_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create mirror db directory {}", parent.display()))?;
    }

    let mut conn = Connection::open(path)
        .with_context(|| format!("open mirror database {}", path.display()))?;

    configure_connection(&conn).context("configure sqlite pragmas")?;
    migrations::migrate(&mut conn).context("apply mirror migrations")?;

    Ok(conn)
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Handle over one migrated mirror database.
#[derive(Debug, Clone)]
pub struct MirrorDb {
    conn: SharedConnection,
}

impl MirrorDb {
    /// # Errors
    ///
    /// Returns an error if opening or migrating the database fails.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_connection(open_mirror_db(path)?))
    }

    /// Fresh, fully migrated in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot create the database.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("open in-memory database")?;
        migrations::migrate(&mut conn).context("apply mirror migrations")?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection without migrating it.
    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotInitialized`] if the schema was not migrated.
    pub fn table<V>(&self, name: &'static str) -> Result<SqliteTable<V>, StoreError>
    where
        V: Serialize + DeserializeOwned + Send + Sync,
    {
        SqliteTable::open(Arc::clone(&self.conn), name)
    }

    /// # Errors
    ///
    /// Returns an error if the intern table cannot be loaded.
    pub fn compactor(&self) -> Result<SqliteCompactor, StoreError> {
        SqliteCompactor::open(Arc::clone(&self.conn))
    }

    #[must_use]
    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }
}

/// Fail fast when a table is used against an unmigrated database.
pub(crate) fn ensure_initialized(conn: &Connection, table: &str) -> Result<(), StoreError> {
    let version = migrations::current_schema_version(conn)?;
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [table],
        |row| row.get(0),
    )?;
    if version < migrations::LATEST_SCHEMA_VERSION || !exists {
        return Err(StoreError::NotInitialized {
            table: table.to_string(),
        });
    }
    Ok(())
}
