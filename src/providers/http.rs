//! Config-driven HTTP/JSON provider client
//!
//! Each provider's endpoint is described in the registry instead of code:
//!
//! ```json
//! "endpoint": {
//!   "url": "https://api.example.com/{addresses}?key={key}",
//!   "method": "get",
//!   "address_pointer": "/ip",
//!   "fields": { "country_code": "/location/country_code", "isp": "/isp/isp" },
//!   "flags": { "vpn": "/risk/is_vpn", "tor": "/risk/is_tor" }
//! }
//! ```
//!
//! Template placeholders: `{address}` (first address of the chunk), `{addresses}` (chunk
//! joined with `address_separator`) and `{key}`. Field values are RFC 6901 JSON pointers
//! into one result object.

use super::{ProviderClient, ProviderError, ProviderResponse, ProviderResult, ProviderSpec};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    #[default]
    Get,
    /// POST the chunk as a JSON array of address strings
    PostJson,
}

/// Pointers for every mapped ResultRecord field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPointers {
    pub risk_score: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country_code: Option<String>,
    pub company: Option<String>,
    pub isp: Option<String>,
    pub as_name: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub url: String,
    #[serde(default)]
    pub method: RequestMode,
    /// Extra headers; values may use `{key}`
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_separator")]
    pub address_separator: String,
    /// Where the result list (or single result object) sits in the body; root if unset
    #[serde(default)]
    pub results_pointer: Option<String>,
    /// Address of each result in batch answers
    #[serde(default)]
    pub address_pointer: Option<String>,
    #[serde(default)]
    pub fields: FieldPointers,
    /// flag name -> pointer; the flag is set when the value is truthy
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
}

fn default_separator() -> String {
    ",".to_string()
}

impl EndpointSpec {
    pub fn get(url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: RequestMode::Get,
            headers: BTreeMap::new(),
            address_separator: default_separator(),
            results_pointer: None,
            address_pointer: None,
            fields: FieldPointers::default(),
            flags: BTreeMap::new(),
        }
    }

    fn render(&self, template: &str, addresses: &[IpAddr], api_key: Option<&str>) -> String {
        let joined = addresses
            .iter()
            .map(IpAddr::to_string)
            .collect::<Vec<_>>()
            .join(&self.address_separator);
        let first = addresses.first().map(IpAddr::to_string).unwrap_or_default();

        template
            .replace("{addresses}", &joined)
            .replace("{address}", &first)
            .replace("{key}", api_key.unwrap_or(""))
    }

    /// Decode a successful answer; failures keep the status the provider sent
    pub fn parse_response(
        &self,
        status: u16,
        text: &str,
        requested: &[IpAddr],
    ) -> Result<Vec<ProviderResult>, ProviderError> {
        let body: Value = serde_json::from_str(text).map_err(|e| ProviderError::InvalidResponse {
            status: Some(status),
            message: format!("body is not JSON: {}", e),
        })?;
        self.map_response(&body, requested)
            .map_err(|e| e.with_status(status))
    }

    /// Map a decoded response body into per-address results
    ///
    /// Results whose address cannot be determined are dropped; with a single requested
    /// address the requested one is assumed.
    pub fn map_response(
        &self,
        body: &Value,
        requested: &[IpAddr],
    ) -> Result<Vec<ProviderResult>, ProviderError> {
        let container = match self.results_pointer.as_deref() {
            Some(ptr) if !ptr.is_empty() => body.pointer(ptr).ok_or_else(|| {
                ProviderError::invalid_response(format!("missing results at '{}'", ptr))
            })?,
            _ => body,
        };

        let items: Vec<&Value> = match container {
            Value::Array(items) => items.iter().collect(),
            Value::Object(_) => vec![container],
            other => {
                return Err(ProviderError::invalid_response(format!(
                    "expected object or array, got {}",
                    other
                )))
            }
        };

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let address = self
                .address_pointer
                .as_deref()
                .and_then(|ptr| item.pointer(ptr))
                .and_then(Value::as_str)
                .and_then(|s| s.trim().parse::<IpAddr>().ok())
                .or_else(|| match requested {
                    [single] => Some(*single),
                    _ => None,
                });

            let Some(address) = address else {
                log::debug!("   ├─ Dropping result without a usable address");
                continue;
            };

            let mut result = ProviderResult::new(address);
            let fields = &self.fields;
            result.risk_score = lookup(item, &fields.risk_score).and_then(as_score);
            result.city = lookup(item, &fields.city).and_then(as_text);
            result.region = lookup(item, &fields.region).and_then(as_text);
            result.country_code = lookup(item, &fields.country_code).and_then(as_text);
            result.company = lookup(item, &fields.company).and_then(as_text);
            result.isp = lookup(item, &fields.isp).and_then(as_text);
            result.as_name = lookup(item, &fields.as_name).and_then(as_text);
            result.hostname = lookup(item, &fields.hostname).and_then(as_text);

            for (flag, ptr) in &self.flags {
                if item.pointer(ptr).map(is_truthy).unwrap_or(false) {
                    result.flags.push(flag.as_str());
                }
            }

            result.raw = item.clone();
            results.push(result);
        }

        Ok(results)
    }
}

fn lookup<'a>(item: &'a Value, pointer: &Option<String>) -> Option<&'a Value> {
    pointer.as_deref().and_then(|ptr| item.pointer(ptr))
}

/// Strings as-is, numbers rendered, arrays by their first element
fn as_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => return items.first().and_then(as_text),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn as_score(value: &Value) -> Option<u8> {
    let score = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if score.is_finite() {
        Some(score.round().clamp(0.0, 100.0) as u8)
    } else {
        None
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Null => false,
    }
}

/// `ProviderClient` for any provider described by an `EndpointSpec`
pub struct HttpJsonClient {
    provider_id: String,
    endpoint: EndpointSpec,
    api_key: Option<String>,
    client: Client,
}

impl HttpJsonClient {
    pub fn new(
        provider_id: &str,
        endpoint: EndpointSpec,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            provider_id: provider_id.to_string(),
            endpoint,
            api_key,
            client,
        })
    }

    /// Client for a registry entry; `Ok(None)` when the entry has no endpoint
    pub fn from_spec(
        spec: &ProviderSpec,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Option<Self>, ProviderError> {
        let Some(endpoint) = spec.endpoint.clone() else {
            return Ok(None);
        };
        if spec.requires_key && api_key.is_none() {
            return Err(ProviderError::MissingKey(spec.id.clone()));
        }
        Self::new(&spec.id, endpoint, api_key, timeout).map(Some)
    }
}

#[async_trait]
impl ProviderClient for HttpJsonClient {
    async fn query(&self, addresses: &[IpAddr]) -> Result<ProviderResponse, ProviderError> {
        let key = self.api_key.as_deref();
        let url = self.endpoint.render(&self.endpoint.url, addresses, key);

        let mut request = match self.endpoint.method {
            RequestMode::Get => self.client.get(&url),
            RequestMode::PostJson => {
                let body: Vec<String> = addresses.iter().map(IpAddr::to_string).collect();
                self.client.post(&url).json(&body)
            }
        };
        request = request.header("Accept", "application/json");
        for (name, value) in &self.endpoint.headers {
            request = request.header(name.as_str(), self.endpoint.render(value, addresses, key));
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        let results = self
            .endpoint
            .parse_response(status.as_u16(), &text, addresses)?;
        log::debug!(
            "   ├─ {} answered {} for {} addresses",
            self.provider_id,
            status.as_u16(),
            addresses.len()
        );

        Ok(ProviderResponse {
            status_code: status.as_u16(),
            results,
        })
    }
}
