//! Query Log Store - append-only ledger of outbound provider calls
//!
//! Every call attempt is recorded, failures included; admission decisions are derived
//! from nothing else. Entries are never updated or deleted.

use super::db::{format_timestamp, parse_timestamp, Database, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use rusqlite::params;

/// One outbound call attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLogEntry {
    pub provider_id: String,
    pub timestamp: DateTime<FixedOffset>,
    /// HTTP status, `None` when the call never got an answer (transport failure, timeout)
    pub status_code: Option<u16>,
    pub error_text: Option<String>,
}

impl QueryLogEntry {
    pub fn new(
        provider_id: impl Into<String>,
        timestamp: DateTime<FixedOffset>,
        status_code: Option<u16>,
        error_text: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            timestamp,
            status_code,
            error_text,
        }
    }
}

#[async_trait]
pub trait QueryLogStore: Send + Sync {
    /// Durably append one entry
    async fn record(&self, entry: QueryLogEntry) -> Result<(), StoreError>;

    /// All entries for a provider, ascending by timestamp
    async fn history(&self, provider_id: &str) -> Result<Vec<QueryLogEntry>, StoreError>;

    /// Entries for a provider at or after `since`, ascending by timestamp
    ///
    /// Default implementation filters the full history.
    async fn history_since(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueryLogEntry>, StoreError> {
        let entries = self.history(provider_id).await?;
        Ok(entries.into_iter().filter(|e| e.timestamp >= since).collect())
    }
}

/// SQLite implementation over the `query_log` table
#[derive(Clone)]
pub struct SqliteQueryLog {
    db: Database,
}

impl SqliteQueryLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn select(
        &self,
        provider_id: &str,
        since_us: i64,
    ) -> Result<Vec<QueryLogEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT provider_id, timestamp, status_code, error_text
                 FROM query_log
                 WHERE provider_id = ?1 AND timestamp_us >= ?2
                 ORDER BY timestamp_us, id",
            )?;

            let rows = stmt.query_map(params![provider_id, since_us], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<u16>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (provider_id, raw_ts, status_code, error_text) = row?;
                entries.push(QueryLogEntry {
                    provider_id,
                    timestamp: parse_timestamp(&raw_ts)?,
                    status_code,
                    error_text,
                });
            }
            Ok(entries)
        })
    }
}

#[async_trait]
impl QueryLogStore for SqliteQueryLog {
    async fn record(&self, entry: QueryLogEntry) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO query_log (provider_id, timestamp, timestamp_us, status_code, error_text)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.provider_id,
                    format_timestamp(&entry.timestamp),
                    entry.timestamp.timestamp_micros(),
                    entry.status_code,
                    entry.error_text,
                ],
            )?;
            Ok(())
        })?;

        log::debug!(
            "📝 Logged {} call: status={:?} error={:?}",
            entry.provider_id,
            entry.status_code,
            entry.error_text
        );
        Ok(())
    }

    async fn history(&self, provider_id: &str) -> Result<Vec<QueryLogEntry>, StoreError> {
        self.select(provider_id, i64::MIN)
    }

    async fn history_since(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueryLogEntry>, StoreError> {
        self.select(provider_id, since.timestamp_micros())
    }
}
