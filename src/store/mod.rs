//! Durable state: query log, results and the recency check built on them
//!
//! - `db` - shared connection, schema bootstrap, `StoreError`
//! - `query_log` - append-only call ledger (input of the rate limiter)
//! - `results` - one upserted record per (provider, address)
//! - `recency` - freshness check that short-circuits queries

pub mod db;
pub mod query_log;
pub mod recency;
pub mod results;

pub use db::{Database, StoreError};
pub use query_log::{QueryLogEntry, QueryLogStore, SqliteQueryLog};
pub use recency::RecencyCache;
pub use results::{Flags, ResultRecord, ResultStore, SqliteResultStore};
