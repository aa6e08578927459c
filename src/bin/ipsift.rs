//! ipsift - look up IP addresses across reputation providers
//!
//! Usage:
//!   ipsift [--providers id,id|all|bulk] [--json] ADDRESS...
//!   ipsift [--providers ...] --status
//!
//! Environment variables:
//!   IPSIFT_DB_PATH - SQLite database path (default: ipsift.db)
//!   IPSIFT_MAX_AGE_DAYS - Re-query results older than this (default: 90)
//!   IPSIFT_WORKERS - Providers queried at once (default: 15)
//!   IPSIFT_TIMEZONE - Zone for daily/monthly quotas (default: local)
//!   IPSIFT_REQUEST_TIMEOUT_MS - HTTP timeout (default: 5000)
//!   IPSIFT_PROVIDERS_FILE - JSON registry overlay with endpoint descriptions
//!   IPSIFT_KEY_<PROVIDER> - API key per provider, e.g. IPSIFT_KEY_ABUSEIPDBCOM

use chrono::Utc;
use dotenv::dotenv;
use ipsift::pipeline::{
    AddressSupplier, ConfigError, PairState, ParsedAddressList, ProviderTask, QueryOrchestrator,
    RuntimeConfig,
};
use ipsift::providers::http::HttpJsonClient;
use ipsift::providers::registry::{ProviderSpec, RegistryFile};
use ipsift::providers::{ProviderError, ProviderRegistry};
use ipsift::shutdown::create_shutdown_token;
use ipsift::store::{Database, ResultRecord, ResultStore, SqliteQueryLog, SqliteResultStore};
use ipsift::RateLimitEngine;
use log::{info, warn};
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Args {
    providers: Vec<String>,
    status: bool,
    json: bool,
    addresses: Vec<String>,
}

impl Args {
    fn parse(raw: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let mut args = Args::default();
        let mut raw = raw.into_iter();

        while let Some(arg) = raw.next() {
            match arg.as_str() {
                "--providers" | "-p" => {
                    let value = raw.next().ok_or_else(|| {
                        ConfigError::InvalidValue("--providers needs a value".to_string())
                    })?;
                    args.providers.push(value);
                }
                "--status" => args.status = true,
                "--json" => args.json = true,
                flag if flag.starts_with("--providers=") => {
                    args.providers.push(flag["--providers=".len()..].to_string());
                }
                flag if flag.starts_with('-') && flag.len() > 1 => {
                    return Err(ConfigError::InvalidValue(format!("unknown option '{}'", flag)));
                }
                _ => args.addresses.push(arg),
            }
        }

        Ok(args)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse(std::env::args().skip(1))?;

    let config = RuntimeConfig::from_env()?;
    config.log_summary();

    let mut registry = ProviderRegistry::builtin();
    if let Some(path) = &config.providers_file {
        registry.merge(RegistryFile::from_path(path)?)?;
        info!("✅ Provider overlay loaded from {}", path.display());
    }
    let selected = registry.select(args.providers.as_slice())?;

    info!("🔧 Opening database...");
    let db = Database::open(&config.db_path)?;
    let query_log = Arc::new(SqliteQueryLog::new(db.clone()));
    let results = Arc::new(SqliteResultStore::new(db));

    if args.status {
        let limiter = RateLimitEngine::new(query_log, config.timezone);
        return print_status(&limiter, &selected).await;
    }

    let addresses = ParsedAddressList::from_inputs(&args.addresses);
    if addresses.is_empty() {
        return Err(ConfigError::InvalidValue("no public IP addresses given".to_string()).into());
    }

    let tasks = build_tasks(&selected, &config);
    if tasks.is_empty() {
        warn!("⚠️  No selected provider has an endpoint and the keys it needs; showing stored results only");
    }

    let orchestrator = QueryOrchestrator::new(query_log, results.clone(), &config);
    let summary = orchestrator
        .run(&addresses, tasks, create_shutdown_token())
        .await?;
    if !summary.is_complete() {
        warn!(
            "⚠️  Run interrupted, {} pairs were never attempted",
            summary.count(PairState::Pending)
        );
    }

    let selected_ids: Vec<&str> = selected.iter().map(|p| p.id.as_str()).collect();
    let mut shown: Vec<ResultRecord> = Vec::new();
    for address in addresses.addresses() {
        let records = results.get(None, &address.to_string()).await?;
        shown.extend(
            records
                .into_iter()
                .filter(|r| selected_ids.contains(&r.provider_id.as_str())),
        );
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&shown)?);
    } else {
        for record in &shown {
            let state = record
                .address
                .parse::<IpAddr>()
                .ok()
                .and_then(|address| summary.state_of(&record.provider_id, address));
            println!("{}", summary_line(record, state));
        }
    }

    Ok(())
}

/// One HTTP client per provider that has an endpoint and, when required, a key
fn build_tasks(selected: &[ProviderSpec], config: &RuntimeConfig) -> Vec<ProviderTask> {
    let mut tasks = Vec::new();

    for spec in selected {
        let key = config.api_key(&spec.id).map(str::to_string);
        match HttpJsonClient::from_spec(spec, key, config.request_timeout) {
            Ok(Some(client)) => tasks.push(ProviderTask::new(spec.clone(), Arc::new(client))),
            Ok(None) => info!("   ├─ {} has no endpoint configured, skipping", spec.id),
            Err(ProviderError::MissingKey(id)) => {
                info!("   ├─ {} needs an API key (IPSIFT_KEY_{}), skipping", id, id.to_uppercase())
            }
            Err(e) => warn!("⚠️  Could not build client for {}: {}", spec.id, e),
        }
    }

    info!("✅ {} providers ready", tasks.len());
    tasks
}

async fn print_status(
    limiter: &RateLimitEngine,
    providers: &[ProviderSpec],
) -> Result<(), Box<dyn std::error::Error>> {
    let now = Utc::now();
    let zone = limiter.zone();

    for spec in providers {
        println!("{} ({})", spec.display_name, spec.id);
        if spec.rules.is_empty() {
            println!("  no rate limits");
            continue;
        }

        for usage in limiter.usage(&spec.id, &spec.rules, now).await? {
            println!(
                "  {:<24} {:>6}/{:<6} {} .. {}{}",
                usage.rule.label(),
                usage.count,
                usage.rule.quota,
                zone.localize(usage.window.start).format("%Y-%m-%d %H:%M:%S"),
                zone.localize(usage.window.end).format("%Y-%m-%d %H:%M:%S"),
                if usage.trigger_hit { "  [provider throttling seen]" } else { "" }
            );
        }
    }

    Ok(())
}

/// `state` is this run's outcome for the pair; `None` for providers without a client
fn summary_line(record: &ResultRecord, state: Option<PairState>) -> String {
    let location: Vec<&str> = [&record.city, &record.region, &record.country_code]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect();
    let risk = record
        .risk_score
        .map(|r| r.to_string())
        .unwrap_or_else(|| "-".to_string());

    let source = match state {
        Some(PairState::QueriedOk) => "new",
        _ => "cached",
    };

    format!(
        "{:<40} {:<18} risk {:>3}  {}  {}  {}  [{}] ({})",
        record.address,
        record.provider_name,
        risk,
        if location.is_empty() { "-".to_string() } else { location.join(", ") },
        record.ownership(),
        record.hostname.as_deref().unwrap_or("-"),
        record.flags,
        source
    )
}
