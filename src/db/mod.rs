//! SQLite store for donor history and per-contact aggregates.
//!
//! The database lives at `~/.donorsync/donorsync.db` unless the config points
//! elsewhere. One connection is shared by the importer thread and any
//! interactive edit path; every multi-statement write goes through
//! [`HistoryDb::with_transaction`] so writers serialize on explicit
//! commit/rollback.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

pub mod contacts;
pub mod history;
pub mod types;
pub use history::IdentityKey;
pub use types::*;

/// The connection handle shared across threads.
pub type SharedDb = Arc<Mutex<HistoryDb>>;

pub struct HistoryDb {
    conn: Connection,
}

impl HistoryDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| E::from(DbError::Sqlite(e)))?;
        match f(self) {
            Ok(val) => {
                if let Err(e) = self.conn.execute_batch("COMMIT") {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(E::from(DbError::Sqlite(e)));
                }
                Ok(val)
            }
            Err(e) => {
                if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK") {
                    log::warn!("HistoryDb: rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the default location and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        log::info!("HistoryDb: opened {}", path.display());
        Ok(Self { conn })
    }

    /// Wrap the database for sharing between the importer and edit paths.
    pub fn into_shared(self) -> SharedDb {
        Arc::new(Mutex::new(self))
    }

    /// Resolve the default database path: `~/.donorsync/donorsync.db`.
    pub fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".donorsync").join("donorsync.db"))
    }

    /// Resolve a configured path, falling back to the default location.
    pub fn resolve_path(configured: Option<&Path>) -> Result<PathBuf, DbError> {
        match configured {
            Some(path) => Ok(path.to_path_buf()),
            None => Self::db_path(),
        }
    }
}

pub mod test_utils {
    use super::HistoryDb;

    /// Create a temporary database for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of the test.
    pub fn test_db() -> HistoryDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        HistoryDb::open_at(path).expect("Failed to open test database")
    }
}
