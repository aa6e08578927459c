//! Per-provider task
//!
//! One worker owns one provider for the whole run and walks its address list in order:
//! recency check, chunking, admission, call, log, upsert. Chunks of the same provider never
//! run in parallel, so each admission decision sees every earlier call of that provider.

use super::engine::{PairOutcome, PairState};
use crate::limiter::windows::ZoneSetting;
use crate::limiter::{Admission, RateLimitEngine};
use crate::providers::{ProviderClient, ProviderError, ProviderResponse, ProviderSpec};
use crate::store::db::StoreError;
use crate::store::query_log::{QueryLogEntry, QueryLogStore};
use crate::store::recency::RecencyCache;
use crate::store::results::ResultStore;
use chrono::{DateTime, FixedOffset, Utc};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Collaborators shared by every worker of a run
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub query_log: Arc<dyn QueryLogStore>,
    pub results: Arc<dyn ResultStore>,
    pub recency: RecencyCache,
    pub limiter: RateLimitEngine,
    pub zone: ZoneSetting,
    pub now_fn: NowFn,
}

impl WorkerContext {
    fn now(&self) -> DateTime<Utc> {
        (self.now_fn)()
    }

    fn local_now(&self) -> DateTime<FixedOffset> {
        self.zone.localize(self.now())
    }
}

pub(crate) struct ProviderWorker {
    spec: ProviderSpec,
    client: Arc<dyn ProviderClient>,
    ctx: WorkerContext,
}

impl ProviderWorker {
    pub fn new(spec: ProviderSpec, client: Arc<dyn ProviderClient>, ctx: WorkerContext) -> Self {
        Self { spec, client, ctx }
    }

    /// Process every address for this provider
    ///
    /// Returns one outcome per address. Addresses not reached before cancellation stay
    /// `Pending`. Storage failures abort the worker.
    pub async fn run(
        self,
        addresses: Vec<IpAddr>,
        cancel: CancellationToken,
    ) -> Result<Vec<PairOutcome>, StoreError> {
        let id = self.spec.id.clone();
        let mut outcomes: Vec<PairOutcome> = addresses
            .iter()
            .map(|addr| PairOutcome::new(&id, *addr))
            .collect();

        // Recency gate first; fresh pairs cost neither a query nor a log entry
        let max_age = self.ctx.recency.max_age();
        let mut to_query = Vec::new();
        for outcome in outcomes.iter_mut() {
            if cancel.is_cancelled() {
                break;
            }
            let address = outcome.address.to_string();
            if self
                .ctx
                .recency
                .has_fresh(&id, &address, max_age, self.ctx.now())
                .await?
            {
                log::debug!("   ├─ {} {}: fresh result cached, skipping", id, address);
                outcome.state = PairState::SkippedFresh;
            } else {
                to_query.push(outcome.address);
            }
        }

        for chunk in to_query.chunks(self.spec.chunk_size()) {
            if cancel.is_cancelled() {
                log::info!("🛑 {} stopping early, {} addresses left", id, remaining(&outcomes));
                break;
            }

            let state = self.process_chunk(chunk, &cancel).await?;
            for (address, pair_state) in state {
                if let Some(outcome) = outcomes
                    .iter_mut()
                    .find(|o| o.address == address && o.state == PairState::Pending)
                {
                    outcome.state = pair_state;
                }
            }
        }

        Ok(outcomes)
    }

    async fn process_chunk(
        &self,
        chunk: &[IpAddr],
        cancel: &CancellationToken,
    ) -> Result<Vec<(IpAddr, PairState)>, StoreError> {
        let id = &self.spec.id;

        let admission = self
            .ctx
            .limiter
            .admit(id, &self.spec.rules, self.ctx.now(), cancel)
            .await?;
        match admission {
            Admission::Allowed => {}
            Admission::Denied => {
                log::debug!("   ├─ {}: rate limited, skipping {} addresses", id, chunk.len());
                return Ok(with_state(chunk, PairState::SkippedRateLimited));
            }
            // Never attempted and never denied; left for the next run
            Admission::Cancelled => return Ok(with_state(chunk, PairState::Pending)),
        }

        if let [single] = chunk {
            log::info!("🔎 Querying {} for {}", self.spec.display_name, single);
        } else {
            log::info!("🔎 Querying {} for {} addresses", self.spec.display_name, chunk.len());
        }

        let response = self.query_isolated(chunk).await;
        let completed_at = self.ctx.local_now();

        match response {
            Ok(response) => {
                self.ctx
                    .query_log
                    .record(QueryLogEntry::new(
                        id.as_str(),
                        completed_at,
                        Some(response.status_code),
                        None,
                    ))
                    .await?;

                let requested: HashSet<IpAddr> = chunk.iter().copied().collect();
                let mut answered = HashSet::new();
                let mut records = Vec::with_capacity(response.results.len());
                for result in response.results {
                    if !requested.contains(&result.address) || !answered.insert(result.address) {
                        log::debug!("   ├─ {}: ignoring unrequested result for {}", id, result.address);
                        continue;
                    }
                    records.push(result.into_record(&self.spec, completed_at));
                }

                if !records.is_empty() {
                    self.ctx.results.upsert_batch(records).await?;
                }

                if answered.len() < chunk.len() {
                    log::warn!(
                        "⚠️  {} returned {} of {} requested addresses",
                        id,
                        answered.len(),
                        chunk.len()
                    );
                }

                Ok(chunk
                    .iter()
                    .map(|addr| {
                        let state = if answered.contains(addr) {
                            PairState::QueriedOk
                        } else {
                            PairState::QueriedFailed
                        };
                        (*addr, state)
                    })
                    .collect())
            }
            Err(e) => {
                log::warn!("❌ {} query failed: {}", self.spec.display_name, e);
                self.ctx
                    .query_log
                    .record(QueryLogEntry::new(
                        id.as_str(),
                        completed_at,
                        e.status_code(),
                        Some(e.error_text()),
                    ))
                    .await?;
                Ok(with_state(chunk, PairState::QueriedFailed))
            }
        }
    }

    /// Run the client call on its own task so a panicking client fails only this chunk
    async fn query_isolated(&self, chunk: &[IpAddr]) -> Result<ProviderResponse, ProviderError> {
        let client = self.client.clone();
        let addresses = chunk.to_vec();

        match tokio::spawn(async move { client.query(&addresses).await }).await {
            Ok(response) => response,
            Err(e) => {
                log::error!("❌ {} client crashed: {}", self.spec.id, e);
                Err(ProviderError::Transport(format!("client crashed: {}", e)))
            }
        }
    }
}

fn with_state(chunk: &[IpAddr], state: PairState) -> Vec<(IpAddr, PairState)> {
    chunk.iter().map(|addr| (*addr, state)).collect()
}

fn remaining(outcomes: &[PairOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| o.state == PairState::Pending)
        .count()
}
