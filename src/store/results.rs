//! Result Store - latest result per (provider, address)
//!
//! Writes are upserts keyed on (provider_id, address): the whole row is replaced, never merged.
//! Batches go through one transaction so a provider answering for many addresses at once
//! cannot leave a partial batch behind.

use super::db::{format_timestamp, parse_timestamp, Database, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder stored when a result carries no flags
const NO_FLAGS: &str = "-";

/// Ordered, de-duplicated descriptors such as `proxy` or `reports:12`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags(Vec<String>);

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a flag unless it is blank or already present
    pub fn push(&mut self, flag: impl Into<String>) {
        let flag = flag.into();
        let flag = flag.trim();
        if flag.is_empty() || self.0.iter().any(|f| f == flag) {
            return;
        }
        self.0.push(flag.to_string());
    }

    pub fn with(mut self, flag: impl Into<String>) -> Self {
        self.push(flag);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Parse the stored form back into flags
    pub fn parse(stored: &str) -> Self {
        let mut flags = Flags::new();
        if stored.trim() == NO_FLAGS {
            return flags;
        }
        for part in stored.split(',') {
            flags.push(part);
        }
        flags
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "{}", NO_FLAGS)
        } else {
            write!(f, "{}", self.0.join(", "))
        }
    }
}

impl<S: Into<String>> FromIterator<S> for Flags {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut flags = Flags::new();
        for flag in iter {
            flags.push(flag);
        }
        flags
    }
}

/// Persisted result of one provider for one address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub provider_id: String,
    pub provider_name: String,
    pub address: String,
    pub timestamp: DateTime<FixedOffset>,
    /// 0-100, higher is worse
    pub risk_score: Option<u8>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country_code: Option<String>,
    pub company: Option<String>,
    pub isp: Option<String>,
    pub as_name: Option<String>,
    pub hostname: Option<String>,
    pub flags: Flags,
    pub raw_payload: serde_json::Value,
}

impl ResultRecord {
    /// Canonical ownership string from company, ISP and AS name
    ///
    /// Values that only differ in punctuation, whitespace or case are shown once.
    pub fn ownership(&self) -> String {
        let mut seen: Vec<String> = Vec::new();
        let mut parts: Vec<&str> = Vec::new();

        for value in [&self.company, &self.isp, &self.as_name].into_iter().flatten() {
            let normalized: String = value
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .collect();
            if normalized.is_empty() || seen.contains(&normalized) {
                continue;
            }
            seen.push(normalized);
            parts.push(value.as_str());
        }

        parts.join(", ")
    }

    fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        let raw_ts: String = row.get("timestamp")?;
        let flags: String = row.get("flags")?;
        let raw_payload: String = row.get("raw_payload")?;

        Ok(Self {
            provider_id: row.get("provider_id")?,
            provider_name: row.get("provider_name")?,
            address: row.get("address")?,
            timestamp: parse_timestamp(&raw_ts)?,
            risk_score: row.get("risk_score")?,
            city: row.get("city")?,
            region: row.get("region")?,
            country_code: row.get("country_code")?,
            company: row.get("company")?,
            isp: row.get("isp")?,
            as_name: row.get("as_name")?,
            hostname: row.get("hostname")?,
            flags: Flags::parse(&flags),
            raw_payload: serde_json::from_str(&raw_payload)?,
        })
    }
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert or fully replace the record for (provider_id, address)
    async fn upsert(&self, record: ResultRecord) -> Result<(), StoreError> {
        self.upsert_batch(vec![record]).await
    }

    /// Upsert all records in one durable operation; on error nothing is written
    async fn upsert_batch(&self, records: Vec<ResultRecord>) -> Result<(), StoreError>;

    /// Records for an address, from one provider or (with `None`) from all of them
    async fn get(
        &self,
        provider_id: Option<&str>,
        address: &str,
    ) -> Result<Vec<ResultRecord>, StoreError>;
}

/// SQLite implementation over the `ip_results` table
#[derive(Clone)]
pub struct SqliteResultStore {
    db: Database,
}

impl SqliteResultStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Number of stored rows (diagnostics)
    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM ip_results", [], |row| row.get(0))?)
        })
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn upsert_batch(&self, records: Vec<ResultRecord>) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    r#"
                    INSERT INTO ip_results (
                        provider_id, provider_name, address, timestamp, timestamp_us,
                        risk_score, city, region, country_code,
                        company, isp, as_name, hostname, flags, raw_payload
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                    ON CONFLICT(provider_id, address) DO UPDATE SET
                        provider_name = excluded.provider_name,
                        timestamp = excluded.timestamp,
                        timestamp_us = excluded.timestamp_us,
                        risk_score = excluded.risk_score,
                        city = excluded.city,
                        region = excluded.region,
                        country_code = excluded.country_code,
                        company = excluded.company,
                        isp = excluded.isp,
                        as_name = excluded.as_name,
                        hostname = excluded.hostname,
                        flags = excluded.flags,
                        raw_payload = excluded.raw_payload
                    "#,
                )?;

                for record in &records {
                    stmt.execute(params![
                        record.provider_id,
                        record.provider_name,
                        record.address,
                        format_timestamp(&record.timestamp),
                        record.timestamp.timestamp_micros(),
                        record.risk_score,
                        record.city,
                        record.region,
                        record.country_code,
                        record.company,
                        record.isp,
                        record.as_name,
                        record.hostname,
                        record.flags.to_string(),
                        serde_json::to_string(&record.raw_payload)?,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;

        log::debug!("✅ Upserted {} result records", records.len());
        Ok(())
    }

    async fn get(
        &self,
        provider_id: Option<&str>,
        address: &str,
    ) -> Result<Vec<ResultRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM ip_results
                 WHERE address = ?1 AND (?2 IS NULL OR provider_id = ?2)
                 ORDER BY provider_id",
            )?;
            let mut rows = stmt.query(params![address, provider_id])?;

            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(ResultRecord::from_row(row)?);
            }
            Ok(records)
        })
    }
}
