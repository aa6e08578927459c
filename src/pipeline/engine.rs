//! Query Orchestrator - drives every (provider, address) pair to a terminal state
//!
//! ```text
//! addresses × providers
//!     ↓
//! RecencyCache::has_fresh      → SKIPPED_FRESH
//!     ↓
//! RateLimitEngine::is_blocked  → SKIPPED_RATE_LIMITED
//!     ↓
//! ProviderClient::query
//!     ↓
//! QueryLogStore::record (always) + ResultStore::upsert_batch (on success)
//!     ↓
//! QUERIED_OK | QUERIED_FAILED
//! ```
//!
//! Providers run concurrently on a bounded pool, one task per provider. A provider failure
//! only fails that provider's pairs; a storage failure stops the whole run.

use super::addresses::AddressSupplier;
use super::config::RuntimeConfig;
use super::worker::{NowFn, ProviderWorker, WorkerContext};
use crate::limiter::windows::ZoneSetting;
use crate::limiter::RateLimitEngine;
use crate::providers::{ProviderClient, ProviderSpec};
use crate::store::db::StoreError;
use crate::store::query_log::QueryLogStore;
use crate::store::recency::RecencyCache;
use crate::store::results::ResultStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairState {
    /// Not reached (run cancelled first)
    Pending,
    SkippedFresh,
    SkippedRateLimited,
    QueriedOk,
    QueriedFailed,
}

impl PairState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairState::Pending => "PENDING",
            PairState::SkippedFresh => "SKIPPED_FRESH",
            PairState::SkippedRateLimited => "SKIPPED_RATE_LIMITED",
            PairState::QueriedOk => "QUERIED_OK",
            PairState::QueriedFailed => "QUERIED_FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != PairState::Pending
    }
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairOutcome {
    pub provider_id: String,
    pub address: IpAddr,
    pub state: PairState,
}

impl PairOutcome {
    pub fn new(provider_id: &str, address: IpAddr) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            address,
            state: PairState::Pending,
        }
    }
}

/// Terminal state of every pair of a run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub outcomes: Vec<PairOutcome>,
}

impl RunSummary {
    pub fn state_of(&self, provider_id: &str, address: IpAddr) -> Option<PairState> {
        self.outcomes
            .iter()
            .find(|o| o.provider_id == provider_id && o.address == address)
            .map(|o| o.state)
    }

    pub fn count(&self, state: PairState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn count_for(&self, provider_id: &str, state: PairState) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.provider_id == provider_id && o.state == state)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.state.is_terminal())
    }
}

/// One provider and the client that talks to it
#[derive(Clone)]
pub struct ProviderTask {
    pub spec: ProviderSpec,
    pub client: Arc<dyn ProviderClient>,
}

impl ProviderTask {
    pub fn new(spec: ProviderSpec, client: Arc<dyn ProviderClient>) -> Self {
        Self { spec, client }
    }
}

pub struct QueryOrchestrator {
    query_log: Arc<dyn QueryLogStore>,
    results: Arc<dyn ResultStore>,
    recency: RecencyCache,
    limiter: RateLimitEngine,
    zone: ZoneSetting,
    workers: usize,

    /// Timestamp function (for testing with mock time)
    now_fn: NowFn,
}

impl QueryOrchestrator {
    /// Orchestrator over the given stores, using the run settings from `config`
    pub fn new(
        query_log: Arc<dyn QueryLogStore>,
        results: Arc<dyn ResultStore>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            recency: RecencyCache::new(results.clone(), config.max_age),
            limiter: RateLimitEngine::new(query_log.clone(), config.timezone),
            query_log,
            results,
            zone: config.timezone,
            workers: config.workers.max(1),
            now_fn: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock (for tests)
    pub fn with_now_fn(mut self, now_fn: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.now_fn = Arc::new(now_fn);
        self
    }

    pub fn limiter(&self) -> &RateLimitEngine {
        &self.limiter
    }

    /// Run every provider over every supplied address
    ///
    /// When `cancel` fires, running providers finish the pair in flight and stop; pairs
    /// never reached are reported `Pending`. A storage error cancels the remaining work
    /// and is returned once every task has stopped.
    pub async fn run(
        &self,
        supplier: &dyn AddressSupplier,
        providers: Vec<ProviderTask>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, StoreError> {
        let addresses = supplier.addresses();
        log::info!(
            "🚀 Querying {} addresses across {} providers ({} workers)",
            addresses.len(),
            providers.len(),
            self.workers
        );

        let ctx = WorkerContext {
            query_log: self.query_log.clone(),
            results: self.results.clone(),
            recency: self.recency.clone(),
            limiter: self.limiter.clone(),
            zone: self.zone,
            now_fn: self.now_fn.clone(),
        };

        // Child token so a storage failure can stop siblings without touching the caller's
        let run_token = cancel.child_token();
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        // Task id -> (provider, addresses), so a panicked task can still be accounted for
        let mut owners: HashMap<task::Id, (String, Vec<IpAddr>)> = HashMap::new();

        for provider in providers {
            let worker = ProviderWorker::new(provider.spec.clone(), provider.client, ctx.clone());
            let task_addresses = addresses.clone();
            let permits = permits.clone();
            let token = run_token.clone();

            let handle = tasks.spawn(async move {
                match permits.acquire_owned().await {
                    Ok(_permit) => worker.run(task_addresses, token).await,
                    Err(_) => Ok(Vec::new()),
                }
            });
            owners.insert(handle.id(), (provider.spec.id, addresses.clone()));
        }

        let mut summary = RunSummary::default();
        let mut failure: Option<StoreError> = None;

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    if let Some((provider_id, addresses)) = owners.remove(&e.id()) {
                        log::error!("❌ {} task panicked: {}", provider_id, e);
                        summary.outcomes.extend(addresses.iter().map(|addr| {
                            let mut outcome = PairOutcome::new(&provider_id, *addr);
                            outcome.state = PairState::QueriedFailed;
                            outcome
                        }));
                    }
                    continue;
                }
            };
            let Some((provider_id, addresses)) = owners.remove(&id) else {
                continue;
            };

            match outcome {
                Ok(outcomes) => {
                    log_provider_summary(&provider_id, &outcomes);
                    summary.outcomes.extend(outcomes);
                }
                Err(e) => {
                    log::error!("❌ Storage failure in {} task: {}", provider_id, e);
                    run_token.cancel();
                    summary
                        .outcomes
                        .extend(addresses.iter().map(|addr| PairOutcome::new(&provider_id, *addr)));
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        log::info!(
            "✅ Run complete: {} queried ok, {} failed, {} fresh, {} rate limited, {} pending",
            summary.count(PairState::QueriedOk),
            summary.count(PairState::QueriedFailed),
            summary.count(PairState::SkippedFresh),
            summary.count(PairState::SkippedRateLimited),
            summary.count(PairState::Pending)
        );

        Ok(summary)
    }
}

fn log_provider_summary(provider_id: &str, outcomes: &[PairOutcome]) {
    let count = |state: PairState| outcomes.iter().filter(|o| o.state == state).count();
    log::info!("📊 {}:", provider_id);
    log::info!("   ├─ Queried OK: {}", count(PairState::QueriedOk));
    log::info!("   ├─ Queried failed: {}", count(PairState::QueriedFailed));
    log::info!("   ├─ Skipped fresh: {}", count(PairState::SkippedFresh));
    log::info!("   ├─ Skipped rate limited: {}", count(PairState::SkippedRateLimited));
    log::info!("   └─ Pending: {}", count(PairState::Pending));
}
