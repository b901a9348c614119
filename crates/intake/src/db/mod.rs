//! Database module for coordinator state.
//!
//! Uses rusqlite (SQLite) with a thread-safe `Database` handle.
//! All access is serialized through a `Mutex<Connection>`. The shared
//! database is the only synchronization primitive between workers:
//! no authoritative coordination state is ever held in memory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub mod error;
pub mod migrations;
pub mod record_repo;
pub mod stats_repo;
pub mod upload_repo;

pub use error::DatabaseError;

/// Physical table names, computed once from the environment namespace.
///
/// Multiple logical environments (e.g. `staging`, `prod`) can share one
/// database file; the namespace becomes a table-name prefix like
/// `staging_uploads`. An empty namespace yields bare names.
#[derive(Debug, Clone)]
pub struct TableNames {
    pub uploads: String,
    pub records: String,
    pub period_stats: String,
    pub migrations: String,
}

impl TableNames {
    fn new(namespace: &str) -> Result<Self, DatabaseError> {
        // Namespaces are spliced into SQL, so only identifier characters pass.
        if !namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(DatabaseError::InvalidNamespace(namespace.to_string()));
        }

        let prefix = if namespace.is_empty() {
            String::new()
        } else {
            format!("{}_", namespace)
        };

        Ok(Self {
            uploads: format!("{}uploads", prefix),
            records: format!("{}records", prefix),
            period_stats: format!("{}period_stats", prefix),
            migrations: if namespace.is_empty() {
                "_migrations".to_string()
            } else {
                format!("{}_migrations", namespace)
            },
        })
    }

    /// Resolves a logical table key used by migration definitions.
    pub(crate) fn resolve(&self, key: &str) -> Option<&str> {
        match key {
            "uploads" => Some(&self.uploads),
            "records" => Some(&self.records),
            "period_stats" => Some(&self.period_stats),
            _ => None,
        }
    }
}

/// Thread-safe database handle wrapping a single rusqlite connection.
///
/// Cloning is cheap (inner `Arc`). All access is serialized through
/// a `Mutex`, which is fine for SQLite (which serializes writes anyway).
/// WAL mode is enabled for concurrent read performance.
#[derive(Clone, Debug)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    tables: Arc<TableNames>,
}

impl Database {
    /// Opens (or creates) the database at the given path and runs all
    /// pending migrations for the given environment namespace.
    pub fn open(path: &Path, namespace: &str) -> Result<Self, DatabaseError> {
        let tables = TableNames::new(namespace)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn, &tables)?;

        log::info!(
            "Database opened at {} (namespace '{}')",
            path.display(),
            namespace
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tables: Arc::new(tables),
        })
    }

    /// Opens an in-memory database for testing. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::open_in_memory_namespaced("")
    }

    /// Opens an in-memory database under a namespace. Runs all migrations.
    pub fn open_in_memory_namespaced(namespace: &str) -> Result<Self, DatabaseError> {
        let tables = TableNames::new(namespace)?;

        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn, &tables)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tables: Arc::new(tables),
        })
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }

    /// Physical table names for this handle's namespace.
    pub fn tables(&self) -> &TableNames {
        &self.tables
    }
}

/// Returns the canonical database path: `~/.intake/data/intake.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".intake").join("data").join("intake.db"))
}

/// Formats a timestamp the way every table column stores it (RFC3339, UTC).
/// Lexicographic comparison of two formatted values matches time order.
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("parse_timestamp: failed to parse '{}': {}", s, e);
            Utc::now()
        })
}
