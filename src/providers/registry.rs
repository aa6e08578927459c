//! Provider Registry - static per-provider configuration
//!
//! Builtin entries carry the documented quotas of every supported provider. A JSON file can
//! overlay them (typically to add `endpoint` descriptions) or add new providers:
//!
//! ```json
//! { "providers": [
//!     { "id": "ipqueryio", "endpoint": { "url": "https://api.ipquery.io/{addresses}" } },
//!     { "id": "custom", "name": "Custom", "batch_size": 50,
//!       "rate_limits": [ { "query_limit": 10, "timeframe": "minute", "type": "rolling" } ] }
//! ] }
//! ```
//!
//! Every rule is validated while loading; a bad timeframe or window type aborts startup.

use super::http::EndpointSpec;
use super::rules::{RateLimitRule, RateLimitRuleConfig, Timeframe};
use crate::pipeline::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub id: String,
    pub display_name: String,
    pub requires_key: bool,
    /// Max addresses per call; `None` for single-address providers
    pub batch_size: Option<usize>,
    /// Evaluated in declaration order
    pub rules: Vec<RateLimitRule>,
    pub endpoint: Option<EndpointSpec>,
}

impl ProviderSpec {
    pub fn new(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            requires_key: false,
            batch_size: None,
            rules: Vec::new(),
            endpoint: None,
        }
    }

    pub fn with_key(mut self) -> Self {
        self.requires_key = true;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn with_rule(mut self, rule: RateLimitRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn supports_batch(&self) -> bool {
        self.batch_size.is_some()
    }

    /// Addresses sent per call
    pub fn chunk_size(&self) -> usize {
        self.batch_size.unwrap_or(1).max(1)
    }
}

/// One provider entry as written in a registry file
///
/// Every field except `id` is optional so an entry can overlay just part of a builtin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default, alias = "display_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub requires_key: Option<bool>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default, alias = "rules")]
    pub rate_limits: Option<Vec<RateLimitRuleConfig>>,
    #[serde(default)]
    pub endpoint: Option<EndpointSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    pub providers: Vec<ProviderConfig>,
}

impl RegistryFile {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }
}

/// Ordered set of known providers
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<ProviderSpec>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<ProviderSpec>) -> Self {
        Self { providers }
    }

    /// Providers supported out of the box, with their documented quotas
    pub fn builtin() -> Self {
        use Timeframe::*;

        let providers = vec![
            ProviderSpec::new("abstractapicom", "AbstractAPI.com")
                .with_key()
                .with_rule(RateLimitRule::rolling(1, Second).with_trigger_text(429, "Too many requests"))
                .with_rule(RateLimitRule::absolute(1000, Day).with_trigger_text(422, "Quota reached")),
            ProviderSpec::new("abuseipdbcom", "AbuseIPDB.com")
                .with_key()
                .with_rule(RateLimitRule::absolute(1000, Day).with_trigger_text(429, "Too many requests")),
            ProviderSpec::new("criminalipio", "CriminalIP.io")
                .with_key()
                .with_rule(RateLimitRule::absolute(50, Month).with_trigger_text(429, "Too many requests")),
            ProviderSpec::new("ip2locationio", "IP2Location.io").with_rule(
                RateLimitRule::absolute(1000, Day)
                    .with_trigger_text(10001, "Invalid API key or insufficient query."),
            ),
            ProviderSpec::new("ipapico", "IPAPI.co")
                .with_rule(RateLimitRule::rolling(2, Minute))
                .with_rule(RateLimitRule::absolute(1000, Day).with_trigger(429)),
            ProviderSpec::new("ipapicom", "IPAPI.com")
                .with_key()
                .with_rule(RateLimitRule::absolute(100, Month).with_trigger_text(104, "usage_limit_reached")),
            ProviderSpec::new("ipapiis", "IPAPI.is")
                .with_key()
                .with_batch_size(100)
                .with_rule(RateLimitRule::absolute(1000, Day).with_trigger(429)),
            ProviderSpec::new("ipapiorg", "IPAPI.org")
                .with_key()
                .with_batch_size(100)
                .with_rule(RateLimitRule::absolute(1000, Day)),
            ProviderSpec::new("ipdashapicom", "IP-API.com")
                .with_batch_size(100)
                .with_rule(RateLimitRule::rolling(15, Minute).with_trigger(429)),
            ProviderSpec::new("ipgeolocationio", "IPGeolocation.io")
                .with_key()
                .with_rule(RateLimitRule::absolute(1000, Day).with_trigger_text(429, "Too many requests")),
            ProviderSpec::new("ipinfoio", "IPInfo.io")
                .with_key()
                .with_batch_size(1000)
                .with_rule(RateLimitRule::rolling(1000, Minute).with_trigger_text(429, "Too many requests")),
            ProviderSpec::new("ipqueryio", "IPQuery.io").with_batch_size(10_000),
            ProviderSpec::new("ipregistryco", "IPRegistry.co")
                .with_key()
                .with_batch_size(1024)
                .with_rule(RateLimitRule::rolling(1000, Minute).with_trigger_text(429, "TOO_MANY_REQUESTS")),
            ProviderSpec::new("virustotalcom", "VirusTotal.com")
                .with_key()
                .with_rule(RateLimitRule::rolling(4, Minute).with_trigger_text(429, "QuotaExceededError"))
                .with_rule(RateLimitRule::absolute(500, Day)),
        ];

        Self { providers }
    }

    /// Registry holding only the providers of a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        registry.merge(RegistryFile::from_json_str(json)?)?;
        Ok(registry)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        registry.merge(RegistryFile::from_path(path)?)?;
        Ok(registry)
    }

    /// Overlay file entries by id; unknown ids are appended
    pub fn merge(&mut self, file: RegistryFile) -> Result<(), ConfigError> {
        for entry in file.providers {
            let id = normalize_id(&entry.id)?;

            let rules = entry
                .rate_limits
                .map(|raw| {
                    raw.into_iter()
                        .map(RateLimitRule::try_from)
                        .collect::<Result<Vec<_>, _>>()
                })
                .transpose()
                .map_err(|e| ConfigError::InvalidValue(format!("provider '{}': {}", id, e)))?;

            if entry.batch_size == Some(0) {
                return Err(ConfigError::InvalidValue(format!(
                    "provider '{}': batch_size must be at least 1",
                    id
                )));
            }

            let spec = match self.providers.iter_mut().position(|p| p.id == id) {
                Some(idx) => &mut self.providers[idx],
                None => {
                    let name = entry.name.clone().unwrap_or_else(|| id.clone());
                    self.providers.push(ProviderSpec::new(&id, &name));
                    let last = self.providers.len() - 1;
                    &mut self.providers[last]
                }
            };

            if let Some(name) = entry.name {
                spec.display_name = name;
            }
            if let Some(requires_key) = entry.requires_key {
                spec.requires_key = requires_key;
            }
            if entry.batch_size.is_some() {
                spec.batch_size = entry.batch_size;
            }
            if let Some(rules) = rules {
                spec.rules = rules;
            }
            if entry.endpoint.is_some() {
                spec.endpoint = entry.endpoint;
            }

            log::debug!("🔧 Registry entry '{}' loaded ({} rules)", spec.id, spec.rules.len());
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderSpec> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Resolve a provider selection
    ///
    /// Tokens are provider ids, `all`, or `bulk` (providers with batch support), optionally
    /// comma-separated. An empty selection means `all`. Order follows first mention, without
    /// duplicates.
    pub fn select<S: AsRef<str>>(&self, tokens: &[S]) -> Result<Vec<ProviderSpec>, ConfigError> {
        let tokens: Vec<String> = tokens
            .iter()
            .flat_map(|t| t.as_ref().split(','))
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        if tokens.is_empty() {
            return Ok(self.providers.clone());
        }

        let mut selected: Vec<ProviderSpec> = Vec::new();
        let mut add = |spec: &ProviderSpec| {
            if !selected.iter().any(|s| s.id == spec.id) {
                selected.push(spec.clone());
            }
        };

        for token in &tokens {
            match token.as_str() {
                "all" => self.providers.iter().for_each(&mut add),
                "bulk" => self
                    .providers
                    .iter()
                    .filter(|p| p.supports_batch())
                    .for_each(&mut add),
                id => match self.get(id) {
                    Some(spec) => add(spec),
                    None => {
                        return Err(ConfigError::InvalidValue(format!(
                            "unknown provider '{}'",
                            id
                        )))
                    }
                },
            }
        }

        Ok(selected)
    }
}

fn normalize_id(raw: &str) -> Result<String, ConfigError> {
    let id = raw.trim().to_lowercase();
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(id)
    } else {
        Err(ConfigError::InvalidValue(format!(
            "provider id '{}' must be non-empty ASCII letters, digits, '-' or '_'",
            raw
        )))
    }
}
