//! External reputation/geolocation providers
//!
//! The orchestrator only sees the `ProviderClient` seam: addresses in, normalized results
//! or a `ProviderError` out. Response-shape knowledge lives behind it (see `http`).

pub mod http;
pub mod registry;
pub mod rules;

use crate::store::results::{Flags, ResultRecord};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use std::net::IpAddr;

pub use registry::{ProviderRegistry, ProviderSpec};
pub use rules::{RateLimitRule, Timeframe, WindowKind};

/// Longest error body kept in the query log
const MAX_ERROR_TEXT: usize = 500;

/// Normalized answer of a provider for one address
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResult {
    pub address: IpAddr,
    pub risk_score: Option<u8>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country_code: Option<String>,
    pub company: Option<String>,
    pub isp: Option<String>,
    pub as_name: Option<String>,
    pub hostname: Option<String>,
    pub flags: Flags,
    pub raw: serde_json::Value,
}

impl ProviderResult {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            risk_score: None,
            city: None,
            region: None,
            country_code: None,
            company: None,
            isp: None,
            as_name: None,
            hostname: None,
            flags: Flags::new(),
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_risk_score(mut self, score: u8) -> Self {
        self.risk_score = Some(score);
        self
    }

    pub fn with_country_code(mut self, cc: &str) -> Self {
        self.country_code = Some(cc.to_string());
        self
    }

    pub fn with_flag(mut self, flag: &str) -> Self {
        self.flags.push(flag);
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }

    /// Stamp the result into the persisted record shape
    pub fn into_record(self, spec: &ProviderSpec, timestamp: DateTime<FixedOffset>) -> ResultRecord {
        ResultRecord {
            provider_id: spec.id.clone(),
            provider_name: spec.display_name.clone(),
            address: self.address.to_string(),
            timestamp,
            risk_score: self.risk_score,
            city: self.city,
            region: self.region,
            country_code: self.country_code,
            company: self.company,
            isp: self.isp,
            as_name: self.as_name,
            hostname: self.hostname,
            flags: self.flags,
            raw_payload: self.raw,
        }
    }
}

/// Successful provider call
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status_code: u16,
    pub results: Vec<ProviderResult>,
}

impl ProviderResponse {
    pub fn ok(results: Vec<ProviderResult>) -> Self {
        Self {
            status_code: 200,
            results,
        }
    }
}

/// Error from a provider call
#[derive(Debug)]
pub enum ProviderError {
    /// Request never got an answer
    Transport(String),
    /// Timeout
    Timeout,
    /// Provider answered with a non-success status
    Status { code: u16, body: String },
    /// Answer could not be interpreted; `status` is set when the provider did answer
    InvalidResponse { status: Option<u16>, message: String },
    /// Provider requires a key that is not configured
    MissingKey(String),
}

impl ProviderError {
    pub fn invalid_response(message: impl Into<String>) -> Self {
        ProviderError::InvalidResponse {
            status: None,
            message: message.into(),
        }
    }

    /// Attach the HTTP status of the answer an undecodable body arrived with
    pub fn with_status(self, code: u16) -> Self {
        match self {
            ProviderError::InvalidResponse { message, .. } => ProviderError::InvalidResponse {
                status: Some(code),
                message,
            },
            other => other,
        }
    }

    /// Status code recorded in the query log; `None` when no answer arrived
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProviderError::Status { code, .. } => Some(*code),
            ProviderError::InvalidResponse { status, .. } => *status,
            _ => None,
        }
    }

    /// Error signature recorded in the query log
    pub fn error_text(&self) -> String {
        let text = match self {
            ProviderError::Status { body, .. } => body.clone(),
            other => other.to_string(),
        };
        truncate_chars(&text, MAX_ERROR_TEXT)
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ProviderError::Timeout => write!(f, "Request timed out"),
            ProviderError::Status { code, body } => {
                write!(f, "HTTP {}: {}", code, truncate_chars(body, 120))
            }
            ProviderError::InvalidResponse { message, .. } => write!(f, "Invalid response: {}", message),
            ProviderError::MissingKey(provider) => write!(f, "No API key configured for {}", provider),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::invalid_response(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Client for one external provider
///
/// Called once per chunk of addresses; a chunk never exceeds the provider's batch size.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn query(&self, addresses: &[IpAddr]) -> Result<ProviderResponse, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_log_signature() {
        let status = ProviderError::Status {
            code: 429,
            body: "Too many requests".to_string(),
        };
        assert_eq!(status.status_code(), Some(429));
        assert_eq!(status.error_text(), "Too many requests");

        let timeout = ProviderError::Timeout;
        assert_eq!(timeout.status_code(), None);
        assert_eq!(timeout.error_text(), "Request timed out");

        let garbled = ProviderError::invalid_response("expected object").with_status(200);
        assert_eq!(garbled.status_code(), Some(200));
        assert_eq!(garbled.error_text(), "Invalid response: expected object");
        assert_eq!(ProviderError::Timeout.with_status(200).status_code(), None);
    }

    #[test]
    fn test_error_text_truncated() {
        let err = ProviderError::Status {
            code: 500,
            body: "é".repeat(MAX_ERROR_TEXT + 10),
        };
        assert_eq!(err.error_text().chars().count(), MAX_ERROR_TEXT);
    }

    #[test]
    fn test_into_record_carries_provider_identity() {
        let spec = ProviderSpec::new("ipqueryio", "IPQuery.io");
        let ts = chrono::Utc::now().fixed_offset();
        let result = ProviderResult::new("203.0.113.7".parse().unwrap())
            .with_risk_score(12)
            .with_flag("vpn")
            .with_flag("vpn");

        let record = result.into_record(&spec, ts);
        assert_eq!(record.provider_id, "ipqueryio");
        assert_eq!(record.provider_name, "IPQuery.io");
        assert_eq!(record.address, "203.0.113.7");
        assert_eq!(record.risk_score, Some(12));
        assert_eq!(record.flags.to_string(), "vpn");
        assert_eq!(record.timestamp, ts);
    }
}
