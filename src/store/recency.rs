//! Recency Cache - skip providers that already answered recently
//!
//! A pure read against the Result Store. Consulted before rate-limit admission so fresh
//! pairs never cost a query or a log entry.

use super::db::StoreError;
use super::results::ResultStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct RecencyCache {
    results: Arc<dyn ResultStore>,
    max_age: Duration,
}

impl RecencyCache {
    /// `max_age` is the single staleness threshold applied to every provider
    pub fn new(results: Arc<dyn ResultStore>, max_age: Duration) -> Self {
        Self { results, max_age }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// True iff a record exists and `now - record.timestamp <= max_age`
    pub async fn has_fresh(
        &self,
        provider_id: &str,
        address: &str,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let records = self.results.get(Some(provider_id), address).await?;

        Ok(records
            .iter()
            .any(|record| now.signed_duration_since(record.timestamp) <= max_age))
    }
}
