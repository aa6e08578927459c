//! Shared SQLite handle, schema bootstrap and store errors
//!
//! Both durable relations live in one database file:
//! - `query_log` - append-only ledger of outbound calls (see `sql/01_query_log.sql`)
//! - `ip_results` - one row per (provider_id, address) (see `sql/02_ip_results.sql`)
//!
//! Writers from different provider tasks share a single connection behind a mutex, so
//! every statement or transaction is serialized by the store itself.

use crate::sqlite_pragma::apply_optimized_pragmas;
use chrono::{DateTime, FixedOffset, SecondsFormat};
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

const QUERY_LOG_SCHEMA: &str = include_str!("../../sql/01_query_log.sql");
const IP_RESULTS_SCHEMA: &str = include_str!("../../sql/02_ip_results.sql");

/// Columns that may be missing from database files written by older builds.
///
/// Definitions must be valid for `ALTER TABLE ... ADD COLUMN`, so NOT NULL columns carry a default.
const QUERY_LOG_COLUMNS: &[(&str, &str)] = &[
    ("provider_id", "TEXT NOT NULL DEFAULT ''"),
    ("timestamp", "TEXT NOT NULL DEFAULT ''"),
    ("timestamp_us", "INTEGER NOT NULL DEFAULT 0"),
    ("status_code", "INTEGER"),
    ("error_text", "TEXT"),
];

const IP_RESULTS_COLUMNS: &[(&str, &str)] = &[
    ("provider_name", "TEXT NOT NULL DEFAULT ''"),
    ("timestamp", "TEXT NOT NULL DEFAULT ''"),
    ("timestamp_us", "INTEGER NOT NULL DEFAULT 0"),
    ("risk_score", "INTEGER"),
    ("city", "TEXT"),
    ("region", "TEXT"),
    ("country_code", "TEXT"),
    ("company", "TEXT"),
    ("isp", "TEXT"),
    ("as_name", "TEXT"),
    ("hostname", "TEXT"),
    ("flags", "TEXT NOT NULL DEFAULT '-'"),
    ("raw_payload", "TEXT NOT NULL DEFAULT 'null'"),
];

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Database(rusqlite::Error),
    Serialization(serde_json::Error),
    Timestamp(String),
    Poisoned,
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::Timestamp(raw) => write!(f, "Invalid stored timestamp: {}", raw),
            StoreError::Poisoned => write!(f, "Database connection lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Cloneable handle to the shared connection
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and bootstrap the schema
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;
        ensure_columns_exist(&mut conn)?;
        initialize_schema(&mut conn)?;

        log::info!("✅ SQLite database ready: {}", db_path.display());

        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database with the full schema (tests, dry runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        apply_optimized_pragmas(&conn)?;
        initialize_schema(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` while holding the connection lock
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut guard)
    }
}

/// Create both relations and their indexes from the embedded schema files
///
/// Idempotent: every statement uses IF NOT EXISTS.
pub fn initialize_schema(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    tx.execute_batch(QUERY_LOG_SCHEMA)?;
    tx.execute_batch(IP_RESULTS_SCHEMA)?;
    tx.commit()?;
    Ok(())
}

/// Run every `.sql` file in `schema_dir`, in file-name order
///
/// Files must be idempotent (IF NOT EXISTS). Stops at the first failing file.
pub fn run_schema_migrations(
    conn: &mut Connection,
    schema_dir: impl AsRef<Path>,
) -> Result<usize, StoreError> {
    let schema_dir = schema_dir.as_ref();

    let mut sql_files: Vec<_> = fs::read_dir(schema_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();
    sql_files.sort();

    log::info!("🔧 Running schema migrations from: {}", schema_dir.display());

    for path in &sql_files {
        let sql_content = fs::read_to_string(path)?;
        conn.execute_batch(&sql_content)?;
        log::info!("   ├─ ✅ {}", path.display());
    }

    log::info!("   └─ {} schema files applied", sql_files.len());
    Ok(sql_files.len())
}

/// Add columns that an older database file lacks
///
/// Must run before `initialize_schema`, whose indexes reference the newer columns.
/// Tables that do not exist yet are skipped.
///
/// Rows in the query log that predate `timestamp_us` get it backfilled from their text timestamp
/// so window queries keep counting them.
pub fn ensure_columns_exist(conn: &mut Connection) -> Result<usize, StoreError> {
    let tx = conn.transaction()?;
    let mut added = 0;

    for (table, columns) in [("query_log", QUERY_LOG_COLUMNS), ("ip_results", IP_RESULTS_COLUMNS)] {
        let existing: Vec<String> = {
            let mut stmt = tx.prepare(&format!("PRAGMA table_info({})", table))?;
            let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
            names.collect::<Result<_, _>>()?
        };
        if existing.is_empty() {
            continue;
        }

        for (column, definition) in columns {
            if existing.iter().any(|name| name == column) {
                continue;
            }
            tx.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, definition
            ))?;
            log::info!("🔧 Added missing column {}.{}", table, column);
            added += 1;

            if *column == "timestamp_us" {
                tx.execute(
                    &format!(
                        "UPDATE {} SET timestamp_us = CAST(strftime('%s', timestamp) AS INTEGER) * 1000000
                         WHERE timestamp_us = 0 AND timestamp != ''",
                        table
                    ),
                    [],
                )?;
            }
        }
    }

    tx.commit()?;
    Ok(added)
}

/// Text form stored in `timestamp` columns; keeps the original offset and full precision
pub(crate) fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>, StoreError> {
    DateTime::parse_from_rfc3339(raw).map_err(|_| StoreError::Timestamp(raw.to_string()))
}
