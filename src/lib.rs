//! ipsift - admission control and result caching for IP reputation lookups
//!
//! Queries many third-party IP reputation/geolocation providers without re-asking for
//! data that is still fresh and without exceeding any provider's documented quota.
//! Admission is derived entirely from a durable log of past calls.

pub mod limiter;
pub mod pipeline;
pub mod providers;
pub mod shutdown;
pub mod sqlite_pragma;
pub mod store;

pub use limiter::windows::ZoneSetting;
pub use limiter::RateLimitEngine;
pub use pipeline::{ConfigError, QueryOrchestrator, RuntimeConfig};
pub use providers::{ProviderClient, ProviderError, ProviderRegistry};
pub use store::{Database, StoreError};
