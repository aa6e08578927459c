//! Integration tests for the Query Orchestrator
//!
//! Providers are replaced by in-process mock clients; both stores run on a real SQLite
//! database so admission decisions see exactly what the orchestrator logged.

#[cfg(test)]
mod orchestrator_integration_tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use ipsift::limiter::windows::ZoneSetting;
    use ipsift::pipeline::{PairState, ProviderTask, QueryOrchestrator, RuntimeConfig};
    use ipsift::providers::{
        ProviderClient, ProviderError, ProviderResponse, ProviderResult, ProviderSpec,
        RateLimitRule, Timeframe,
    };
    use ipsift::store::{
        Database, QueryLogEntry, QueryLogStore, ResultRecord, ResultStore, SqliteQueryLog,
        SqliteResultStore, StoreError,
    };
    use std::net::IpAddr;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration as StdDuration, Instant};
    use tokio_util::sync::CancellationToken;

    #[derive(Clone, Copy)]
    enum Behavior {
        Answer,
        /// Answer only for the first address of each chunk
        AnswerFirstOnly,
        Status(u16, &'static str),
        Timeout,
        /// Answer after a delay
        Slow(u64),
        Crash,
    }

    struct MockClient {
        behavior: Behavior,
        calls: Mutex<Vec<Vec<IpAddr>>>,
    }

    impl MockClient {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn chunk_sizes(&self) -> Vec<usize> {
            self.calls.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl ProviderClient for MockClient {
        async fn query(&self, addresses: &[IpAddr]) -> Result<ProviderResponse, ProviderError> {
            self.calls.lock().unwrap().push(addresses.to_vec());

            let answer = |addr: &IpAddr| {
                ProviderResult::new(*addr)
                    .with_risk_score(10)
                    .with_country_code("NL")
                    .with_flag("hosting")
                    .with_raw(serde_json::json!({ "ip": addr.to_string() }))
            };

            match self.behavior {
                Behavior::Answer => Ok(ProviderResponse::ok(addresses.iter().map(answer).collect())),
                Behavior::AnswerFirstOnly => Ok(ProviderResponse::ok(
                    addresses.iter().take(1).map(answer).collect(),
                )),
                Behavior::Status(code, body) => Err(ProviderError::Status {
                    code,
                    body: body.to_string(),
                }),
                Behavior::Timeout => Err(ProviderError::Timeout),
                Behavior::Slow(ms) => {
                    tokio::time::sleep(StdDuration::from_millis(ms)).await;
                    Ok(ProviderResponse::ok(addresses.iter().map(answer).collect()))
                }
                Behavior::Crash => panic!("provider client crashed"),
            }
        }
    }

    /// Query log whose writes fail for one provider
    struct BrokenLog {
        inner: Arc<SqliteQueryLog>,
        broken_provider: &'static str,
    }

    #[async_trait]
    impl QueryLogStore for BrokenLog {
        async fn record(&self, entry: QueryLogEntry) -> Result<(), StoreError> {
            if entry.provider_id == self.broken_provider {
                return Err(StoreError::Poisoned);
            }
            self.inner.record(entry).await
        }

        async fn history(&self, provider_id: &str) -> Result<Vec<QueryLogEntry>, StoreError> {
            self.inner.history(provider_id).await
        }
    }

    /// Result store that panics when storing one provider's records
    struct CrashingResults {
        inner: Arc<SqliteResultStore>,
        crash_provider: &'static str,
    }

    #[async_trait]
    impl ResultStore for CrashingResults {
        async fn upsert_batch(&self, records: Vec<ResultRecord>) -> Result<(), StoreError> {
            if records.iter().any(|r| r.provider_id == self.crash_provider) {
                panic!("result store crashed");
            }
            self.inner.upsert_batch(records).await
        }

        async fn get(
            &self,
            provider_id: Option<&str>,
            address: &str,
        ) -> Result<Vec<ResultRecord>, StoreError> {
            self.inner.get(provider_id, address).await
        }
    }

    struct Harness {
        query_log: Arc<SqliteQueryLog>,
        results: Arc<SqliteResultStore>,
        orchestrator: QueryOrchestrator,
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        harness_with_clock(fixed_now)
    }

    fn harness_with_clock(now_fn: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Harness {
        let db = Database::open_in_memory().unwrap();
        let query_log = Arc::new(SqliteQueryLog::new(db.clone()));
        let results = Arc::new(SqliteResultStore::new(db));
        let orchestrator = QueryOrchestrator::new(query_log.clone(), results.clone(), &test_config())
            .with_now_fn(now_fn);

        Harness {
            query_log,
            results,
            orchestrator,
        }
    }

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            timezone: ZoneSetting::utc(),
            workers: 4,
            ..RuntimeConfig::default()
        }
    }

    fn addrs(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn task(spec: ProviderSpec, client: &Arc<MockClient>) -> ProviderTask {
        ProviderTask::new(spec, client.clone())
    }

    #[tokio::test]
    async fn test_queries_log_and_store_results() {
        let h = harness();
        let targets = addrs(&["8.8.8.8", "1.1.1.1"]);
        let client = MockClient::new(Behavior::Answer);

        let summary = h
            .orchestrator
            .run(
                &targets,
                vec![task(ProviderSpec::new("geo", "Geo Service"), &client)],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.count(PairState::QueriedOk), 2);
        assert!(summary.is_complete());
        assert_eq!(client.chunk_sizes(), vec![1, 1]);

        let log = h.query_log.history("geo").await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|e| e.status_code == Some(200) && e.error_text.is_none()));

        let stored = h.results.get(Some("geo"), "8.8.8.8").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].provider_name, "Geo Service");
        assert_eq!(stored[0].timestamp, fixed_now().fixed_offset());
        assert_eq!(stored[0].flags.to_string(), "hosting");
    }

    #[tokio::test]
    async fn test_fresh_results_skip_query_and_log() {
        let h = harness();
        let targets = addrs(&["8.8.8.8"]);
        let client = MockClient::new(Behavior::Answer);
        let spec = ProviderSpec::new("geo", "Geo Service");

        h.orchestrator
            .run(&targets, vec![task(spec.clone(), &client)], CancellationToken::new())
            .await
            .unwrap();
        let summary = h
            .orchestrator
            .run(&targets, vec![task(spec, &client)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.state_of("geo", targets[0]), Some(PairState::SkippedFresh));
        assert_eq!(client.chunk_sizes().len(), 1);
        assert_eq!(h.query_log.history("geo").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_results_are_requeried() {
        let clock = Arc::new(Mutex::new(fixed_now()));
        let reader = clock.clone();
        let h = harness_with_clock(move || *reader.lock().unwrap());
        let targets = addrs(&["8.8.8.8"]);
        let client = MockClient::new(Behavior::Answer);
        let spec = ProviderSpec::new("geo", "Geo Service");

        h.orchestrator
            .run(&targets, vec![task(spec.clone(), &client)], CancellationToken::new())
            .await
            .unwrap();

        *clock.lock().unwrap() = fixed_now() + Duration::days(91);
        let summary = h
            .orchestrator
            .run(&targets, vec![task(spec, &client)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.state_of("geo", targets[0]), Some(PairState::QueriedOk));
        let stored = h.results.get(Some("geo"), "8.8.8.8").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].timestamp, (fixed_now() + Duration::days(91)).fixed_offset());
    }

    #[tokio::test]
    async fn test_batch_provider_chunks_addresses() {
        let h = harness();
        let targets = addrs(&["8.8.8.8", "8.8.4.4", "1.1.1.1", "1.0.0.1", "9.9.9.9"]);
        let client = MockClient::new(Behavior::Answer);
        let spec = ProviderSpec::new("bulk", "Bulk Geo").with_batch_size(2);

        let summary = h
            .orchestrator
            .run(&targets, vec![task(spec, &client)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(client.chunk_sizes(), vec![2, 2, 1]);
        assert_eq!(summary.count_for("bulk", PairState::QueriedOk), 5);
        assert_eq!(h.query_log.history("bulk").await.unwrap().len(), 3);
        assert_eq!(h.results.count().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_missing_batch_answers_marked_failed() {
        let h = harness();
        let targets = addrs(&["8.8.8.8", "8.8.4.4"]);
        let client = MockClient::new(Behavior::AnswerFirstOnly);
        let spec = ProviderSpec::new("bulk", "Bulk Geo").with_batch_size(10);

        let summary = h
            .orchestrator
            .run(&targets, vec![task(spec, &client)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.state_of("bulk", targets[0]), Some(PairState::QueriedOk));
        assert_eq!(summary.state_of("bulk", targets[1]), Some(PairState::QueriedFailed));
        assert_eq!(h.results.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_skips_without_logging() {
        let h = harness();
        let targets = addrs(&["8.8.8.8", "1.1.1.1", "9.9.9.9"]);
        let client = MockClient::new(Behavior::Answer);
        let spec = ProviderSpec::new("strict", "Strict")
            .with_rule(RateLimitRule::rolling(1, Timeframe::Minute));

        let summary = h
            .orchestrator
            .run(&targets, vec![task(spec, &client)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.count(PairState::QueriedOk), 1);
        assert_eq!(summary.count(PairState::SkippedRateLimited), 2);
        assert_eq!(h.query_log.history("strict").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_is_isolated_and_triggers_cooldown() {
        let h = harness();
        let targets = addrs(&["8.8.8.8", "1.1.1.1"]);
        let failing = MockClient::new(Behavior::Status(429, "Too many requests"));
        let healthy = MockClient::new(Behavior::Answer);

        let flaky_spec = ProviderSpec::new("flaky", "Flaky").with_rule(
            RateLimitRule::absolute(1000, Timeframe::Day).with_trigger_text(429, "Too many"),
        );

        let summary = h
            .orchestrator
            .run(
                &targets,
                vec![
                    task(flaky_spec, &failing),
                    task(ProviderSpec::new("geo", "Geo Service"), &healthy),
                ],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        // First call failed with the trigger signature, the second pair is in cooldown
        assert_eq!(summary.state_of("flaky", targets[0]), Some(PairState::QueriedFailed));
        assert_eq!(summary.state_of("flaky", targets[1]), Some(PairState::SkippedRateLimited));
        assert_eq!(summary.count_for("geo", PairState::QueriedOk), 2);

        let log = h.query_log.history("flaky").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status_code, Some(429));
        assert_eq!(log[0].error_text.as_deref(), Some("Too many requests"));
        assert!(h.results.get(Some("flaky"), "8.8.8.8").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_logged_without_status() {
        let h = harness();
        let targets = addrs(&["8.8.8.8"]);
        let client = MockClient::new(Behavior::Timeout);

        let summary = h
            .orchestrator
            .run(
                &targets,
                vec![task(ProviderSpec::new("slow", "Slow"), &client)],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.count(PairState::QueriedFailed), 1);
        let log = h.query_log.history("slow").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status_code, None);
        assert_eq!(log[0].error_text.as_deref(), Some("Request timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let h = harness();
        let targets = addrs(&["8.8.8.8", "1.1.1.1"]);
        let client = MockClient::new(Behavior::Answer);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = h
            .orchestrator
            .run(
                &targets,
                vec![task(ProviderSpec::new("geo", "Geo Service"), &client)],
                cancel,
            )
            .await
            .unwrap();

        assert_eq!(summary.count(PairState::Pending), 2);
        assert!(client.chunk_sizes().is_empty());
        assert!(h.query_log.history("geo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_finishes_in_flight_pair() {
        let h = harness();
        let targets = addrs(&["8.8.8.8", "1.1.1.1", "9.9.9.9"]);
        let client = MockClient::new(Behavior::Slow(400));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let (summary, _) = tokio::join!(
            h.orchestrator.run(
                &targets,
                vec![task(ProviderSpec::new("slow", "Slow"), &client)],
                cancel,
            ),
            async move {
                tokio::time::sleep(StdDuration::from_millis(100)).await;
                trigger.cancel();
            }
        );
        let summary = summary.unwrap();

        // The call already in flight completes and is logged; nothing new starts
        assert_eq!(summary.state_of("slow", targets[0]), Some(PairState::QueriedOk));
        assert_eq!(summary.state_of("slow", targets[1]), Some(PairState::Pending));
        assert_eq!(summary.state_of("slow", targets[2]), Some(PairState::Pending));
        assert_eq!(client.chunk_sizes(), vec![1]);
        assert_eq!(h.query_log.history("slow").await.unwrap().len(), 1);
        assert_eq!(h.results.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_throttle_leaves_pair_pending() {
        let h = harness();
        let targets = addrs(&["8.8.8.8", "1.1.1.1"]);
        let client = MockClient::new(Behavior::Answer);
        let spec = ProviderSpec::new("burst", "Burst")
            .with_rule(RateLimitRule::rolling(1, Timeframe::Second));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let (summary, _) = tokio::join!(
            h.orchestrator.run(&targets, vec![task(spec, &client)], cancel),
            async move {
                tokio::time::sleep(StdDuration::from_millis(300)).await;
                trigger.cancel();
            }
        );
        let summary = summary.unwrap();

        // The second pair was waiting out the burst limit, not denied by it
        assert_eq!(summary.state_of("burst", targets[0]), Some(PairState::QueriedOk));
        assert_eq!(summary.state_of("burst", targets[1]), Some(PairState::Pending));
        assert_eq!(summary.count(PairState::SkippedRateLimited), 0);
        assert_eq!(client.chunk_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn test_storage_failure_stops_siblings_and_fails_run() {
        let db = Database::open_in_memory().unwrap();
        let sqlite_log = Arc::new(SqliteQueryLog::new(db.clone()));
        let log = Arc::new(BrokenLog {
            inner: sqlite_log.clone(),
            broken_provider: "broken",
        });
        let results = Arc::new(SqliteResultStore::new(db));
        let orchestrator =
            QueryOrchestrator::new(log, results, &test_config()).with_now_fn(fixed_now);

        let targets = addrs(&["8.8.8.8", "1.1.1.1", "9.9.9.9"]);
        let broken = MockClient::new(Behavior::Answer);
        let steady = MockClient::new(Behavior::Slow(200));

        let outcome = orchestrator
            .run(
                &targets,
                vec![
                    task(ProviderSpec::new("broken", "Broken"), &broken),
                    task(ProviderSpec::new("steady", "Steady"), &steady),
                ],
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(outcome, Err(StoreError::Poisoned)));
        assert_eq!(broken.chunk_sizes(), vec![1]);
        // The sibling finished its call in flight, then stopped
        assert!(steady.chunk_sizes().len() < targets.len());
        assert_eq!(
            sqlite_log.history("steady").await.unwrap().len(),
            steady.chunk_sizes().len()
        );
    }

    #[tokio::test]
    async fn test_slow_provider_does_not_serialize_others() {
        let h = harness();
        let targets = addrs(&["8.8.8.8"]);
        let clients: Vec<Arc<MockClient>> =
            (0..3).map(|_| MockClient::new(Behavior::Slow(400))).collect();
        let tasks: Vec<ProviderTask> = clients
            .iter()
            .enumerate()
            .map(|(i, client)| task(ProviderSpec::new(&format!("slow{}", i), "Slow"), client))
            .collect();

        let started = Instant::now();
        let summary = h
            .orchestrator
            .run(&targets, tasks, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.count(PairState::QueriedOk), 3);
        // Run one after another these would take 1.2s
        assert!(started.elapsed() < StdDuration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_crashing_client_fails_only_its_pairs() {
        let h = harness();
        let targets = addrs(&["8.8.8.8", "1.1.1.1"]);
        let crashing = MockClient::new(Behavior::Crash);
        let healthy = MockClient::new(Behavior::Answer);

        let summary = h
            .orchestrator
            .run(
                &targets,
                vec![
                    task(ProviderSpec::new("crashy", "Crashy"), &crashing),
                    task(ProviderSpec::new("geo", "Geo Service"), &healthy),
                ],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.outcomes.len(), 4);
        assert_eq!(summary.count_for("crashy", PairState::QueriedFailed), 2);
        assert_eq!(summary.count_for("geo", PairState::QueriedOk), 2);

        // Each attempt is still in the log, without a status
        let log = h.query_log.history("crashy").await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|e| e.status_code.is_none()));
        assert!(log[0].error_text.as_deref().unwrap_or("").contains("crashed"));
    }

    #[tokio::test]
    async fn test_crashed_provider_task_still_reported() {
        let db = Database::open_in_memory().unwrap();
        let query_log = Arc::new(SqliteQueryLog::new(db.clone()));
        let results = Arc::new(CrashingResults {
            inner: Arc::new(SqliteResultStore::new(db)),
            crash_provider: "crashy",
        });
        let orchestrator = QueryOrchestrator::new(query_log.clone(), results, &test_config())
            .with_now_fn(fixed_now);

        let targets = addrs(&["8.8.8.8", "1.1.1.1"]);
        let crashy = MockClient::new(Behavior::Answer);
        let healthy = MockClient::new(Behavior::Answer);

        let summary = orchestrator
            .run(
                &targets,
                vec![
                    task(ProviderSpec::new("crashy", "Crashy"), &crashy),
                    task(ProviderSpec::new("geo", "Geo Service"), &healthy),
                ],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.outcomes.len(), 4);
        assert_eq!(summary.count_for("crashy", PairState::QueriedFailed), 2);
        assert_eq!(summary.count_for("geo", PairState::QueriedOk), 2);
        assert!(summary.is_complete());
        // The call made before the crash was logged
        assert_eq!(query_log.history("crashy").await.unwrap().len(), 1);
    }
}
