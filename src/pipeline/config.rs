//! Runtime configuration from environment variables
//!
//! Loaded once at startup (after `.env`) with defaults for everything except API keys.

use crate::limiter::windows::ZoneSetting;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Prefix of per-provider API key variables, e.g. `IPSIFT_KEY_ABUSEIPDBCOM`
pub const KEY_VAR_PREFIX: &str = "IPSIFT_KEY_";

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
            ConfigError::Io(e) => write!(f, "Failed to read configuration file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse configuration file: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to SQLite database file
    pub db_path: PathBuf,

    /// Results younger than this are not re-queried
    pub max_age: chrono::Duration,

    /// Upper bound on provider tasks running at once
    pub workers: usize,

    /// Zone absolute windows are aligned in
    pub timezone: ZoneSetting,

    pub request_timeout: Duration,

    /// Optional JSON file overlaid on the builtin provider registry
    pub providers_file: Option<PathBuf>,

    /// provider_id -> API key
    pub api_keys: HashMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("ipsift.db"),
            max_age: chrono::Duration::days(90),
            workers: 15,
            timezone: ZoneSetting::Local,
            request_timeout: Duration::from_millis(5_000),
            providers_file: None,
            api_keys: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `IPSIFT_DB_PATH` (default: ipsift.db)
    /// - `IPSIFT_MAX_AGE_DAYS` (default: 90)
    /// - `IPSIFT_WORKERS` (default: 15)
    /// - `IPSIFT_TIMEZONE` (default: local; also `UTC` or `+HH:MM`)
    /// - `IPSIFT_REQUEST_TIMEOUT_MS` (default: 5000)
    /// - `IPSIFT_PROVIDERS_FILE` (optional)
    /// - `IPSIFT_KEY_<PROVIDER>` per provider
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(env::vars())
    }

    /// Build from an explicit variable list; `from_env` passes the process environment
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let defaults = Self::default();

        let db_path = vars
            .get("IPSIFT_DB_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let max_age_days: i64 = parse_var(&vars, "IPSIFT_MAX_AGE_DAYS", 90)?;
        if max_age_days < 0 {
            return Err(ConfigError::InvalidValue(
                "IPSIFT_MAX_AGE_DAYS must not be negative".to_string(),
            ));
        }
        let max_age = chrono::Duration::try_days(max_age_days).ok_or_else(|| {
            ConfigError::InvalidValue(format!("IPSIFT_MAX_AGE_DAYS {} is out of range", max_age_days))
        })?;

        let workers: usize = parse_var(&vars, "IPSIFT_WORKERS", 15)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue(
                "IPSIFT_WORKERS must be at least 1".to_string(),
            ));
        }

        let timezone = match vars.get("IPSIFT_TIMEZONE") {
            Some(raw) if !raw.trim().is_empty() => raw.parse()?,
            _ => ZoneSetting::Local,
        };

        let timeout_ms: u64 = parse_var(&vars, "IPSIFT_REQUEST_TIMEOUT_MS", 5_000)?;

        let providers_file = vars
            .get("IPSIFT_PROVIDERS_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let api_keys = vars
            .iter()
            .filter_map(|(name, value)| {
                let provider = name.strip_prefix(KEY_VAR_PREFIX)?;
                let value = value.trim();
                if provider.is_empty() || value.is_empty() {
                    return None;
                }
                Some((provider.to_lowercase(), value.to_string()))
            })
            .collect();

        Ok(Self {
            db_path,
            max_age,
            workers,
            timezone,
            request_timeout: Duration::from_millis(timeout_ms),
            providers_file,
            api_keys,
        })
    }

    pub fn api_key(&self, provider_id: &str) -> Option<&str> {
        self.api_keys.get(provider_id).map(String::as_str)
    }

    pub fn log_summary(&self) {
        log::info!("⚙️  Configuration:");
        log::info!("   ├─ Database: {}", self.db_path.display());
        log::info!("   ├─ Max age: {} days", self.max_age.num_days());
        log::info!("   ├─ Workers: {}", self.workers);
        log::info!("   ├─ Timezone: {}", self.timezone);
        log::info!("   ├─ Request timeout: {}ms", self.request_timeout.as_millis());
        if let Some(path) = &self.providers_file {
            log::info!("   ├─ Providers file: {}", path.display());
        }
        log::info!("   └─ API keys: {}", self.api_keys.len());
    }
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{} has invalid value '{}'", name, raw))
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::from_vars(Vec::new()).unwrap();

        assert_eq!(config.db_path, PathBuf::from("ipsift.db"));
        assert_eq!(config.max_age, chrono::Duration::days(90));
        assert_eq!(config.workers, 15);
        assert_eq!(config.timezone, ZoneSetting::Local);
        assert_eq!(config.request_timeout, Duration::from_millis(5_000));
        assert!(config.providers_file.is_none());
        assert!(config.api_keys.is_empty());
    }

    #[test]
    fn test_custom_config() {
        let config = RuntimeConfig::from_vars(vars(&[
            ("IPSIFT_DB_PATH", "/tmp/ipsift-test.db"),
            ("IPSIFT_MAX_AGE_DAYS", "7"),
            ("IPSIFT_WORKERS", "4"),
            ("IPSIFT_TIMEZONE", "-05:00"),
            ("IPSIFT_REQUEST_TIMEOUT_MS", "1500"),
            ("IPSIFT_KEY_ABUSEIPDBCOM", " secret "),
            ("IPSIFT_KEY_IPINFOIO", ""),
            ("UNRELATED", "x"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/ipsift-test.db"));
        assert_eq!(config.max_age, chrono::Duration::days(7));
        assert_eq!(config.workers, 4);
        assert_eq!(
            config.timezone,
            ZoneSetting::Fixed(FixedOffset::west_opt(5 * 3600).unwrap())
        );
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.api_key("abuseipdbcom"), Some("secret"));
        assert_eq!(config.api_key("ipinfoio"), None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            RuntimeConfig::from_vars(vars(&[("IPSIFT_WORKERS", "many")])),
            Err(ConfigError::InvalidValue(msg)) if msg.contains("IPSIFT_WORKERS")
        ));
        assert!(RuntimeConfig::from_vars(vars(&[("IPSIFT_WORKERS", "0")])).is_err());
        assert!(RuntimeConfig::from_vars(vars(&[("IPSIFT_MAX_AGE_DAYS", "-1")])).is_err());
        assert!(matches!(
            RuntimeConfig::from_vars(vars(&[("IPSIFT_MAX_AGE_DAYS", "999999999999999")])),
            Err(ConfigError::InvalidValue(msg)) if msg.contains("out of range")
        ));
        assert!(RuntimeConfig::from_vars(vars(&[("IPSIFT_TIMEZONE", "Mars/Olympus")])).is_err());
    }
}
