//! Declarative rate-limit rules
//!
//! Rules come from static provider configuration. Timeframe and window type are parsed and
//! validated when the configuration is loaded; a malformed rule never reaches the limiter.

use crate::pipeline::config::ConfigError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named period a quota is counted over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    Second,
    Minute,
    Hour,
    Day,
    Month,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Second => "second",
            Timeframe::Minute => "minute",
            Timeframe::Hour => "hour",
            Timeframe::Day => "day",
            Timeframe::Month => "month",
        }
    }

    /// Span of a rolling window; a month is approximated as 30 days
    pub fn rolling_duration(&self) -> Duration {
        match self {
            Timeframe::Second => Duration::seconds(1),
            Timeframe::Minute => Duration::seconds(60),
            Timeframe::Hour => Duration::seconds(3_600),
            Timeframe::Day => Duration::seconds(86_400),
            Timeframe::Month => Duration::days(30),
        }
    }
}

impl FromStr for Timeframe {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "second" => Ok(Timeframe::Second),
            "minute" => Ok(Timeframe::Minute),
            "hour" => Ok(Timeframe::Hour),
            "day" => Ok(Timeframe::Day),
            "month" => Ok(Timeframe::Month),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown timeframe '{}' (expected second, minute, hour, day or month)",
                other
            ))),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the observation window is anchored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    /// Ends at `now`, reaches back one timeframe
    Rolling,
    /// Aligned to the start of the current calendar period in the configured zone
    Absolute,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Rolling => "rolling",
            WindowKind::Absolute => "absolute",
        }
    }
}

impl FromStr for WindowKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rolling" => Ok(WindowKind::Rolling),
            "absolute" => Ok(WindowKind::Absolute),
            other => Err(ConfigError::InvalidValue(format!(
                "window type must be 'rolling' or 'absolute', got '{}'",
                other
            ))),
        }
    }
}

/// One documented quota boundary of a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub quota: u32,
    pub timeframe: Timeframe,
    pub window_kind: WindowKind,
    /// Status code a provider answers with once this quota is exhausted
    pub trigger_status_code: Option<u16>,
    /// Substring that must appear in the logged error text to confirm the trigger
    pub trigger_error_text: Option<String>,
}

impl RateLimitRule {
    pub fn rolling(quota: u32, timeframe: Timeframe) -> Self {
        Self {
            quota,
            timeframe,
            window_kind: WindowKind::Rolling,
            trigger_status_code: None,
            trigger_error_text: None,
        }
    }

    pub fn absolute(quota: u32, timeframe: Timeframe) -> Self {
        Self {
            window_kind: WindowKind::Absolute,
            ..Self::rolling(quota, timeframe)
        }
    }

    pub fn with_trigger(mut self, status_code: u16) -> Self {
        self.trigger_status_code = Some(status_code);
        self
    }

    pub fn with_trigger_text(mut self, status_code: u16, error_text: &str) -> Self {
        self.trigger_status_code = Some(status_code);
        self.trigger_error_text = Some(error_text.to_string());
        self
    }

    /// Sub-second burst rules throttle callers instead of rejecting them
    pub fn is_throttle(&self) -> bool {
        self.timeframe == Timeframe::Second
    }

    /// Short label for logs, e.g. `1000/day (absolute)`
    pub fn label(&self) -> String {
        format!("{}/{} ({})", self.quota, self.timeframe, self.window_kind.as_str())
    }
}

/// Rule as written in provider configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRuleConfig {
    #[serde(alias = "query_limit")]
    pub quota: u32,
    pub timeframe: String,
    #[serde(rename = "type", default = "default_window_kind")]
    pub window_kind: String,
    #[serde(default, alias = "status_code")]
    pub trigger_status_code: Option<u16>,
    #[serde(default, alias = "error_text")]
    pub trigger_error_text: Option<String>,
}

fn default_window_kind() -> String {
    "rolling".to_string()
}

impl TryFrom<RateLimitRuleConfig> for RateLimitRule {
    type Error = ConfigError;

    fn try_from(raw: RateLimitRuleConfig) -> Result<Self, Self::Error> {
        if raw.quota == 0 {
            return Err(ConfigError::InvalidValue(
                "rate limit quota must be at least 1".to_string(),
            ));
        }
        if raw.trigger_error_text.is_some() && raw.trigger_status_code.is_none() {
            return Err(ConfigError::InvalidValue(
                "trigger error_text requires a trigger status_code".to_string(),
            ));
        }

        Ok(Self {
            quota: raw.quota,
            timeframe: raw.timeframe.parse()?,
            window_kind: raw.window_kind.parse()?,
            trigger_status_code: raw.trigger_status_code,
            trigger_error_text: raw.trigger_error_text.filter(|t| !t.is_empty()),
        })
    }
}

impl From<&RateLimitRule> for RateLimitRuleConfig {
    fn from(rule: &RateLimitRule) -> Self {
        Self {
            quota: rule.quota,
            timeframe: rule.timeframe.as_str().to_string(),
            window_kind: rule.window_kind.as_str().to_string(),
            trigger_status_code: rule.trigger_status_code,
            trigger_error_text: rule.trigger_error_text.clone(),
        }
    }
}
