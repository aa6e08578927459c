//! Run orchestration
//!
//! - `config` - environment-driven runtime settings and `ConfigError`
//! - `addresses` - Address Supplier
//! - `engine` - Query Orchestrator and run summary
//! - `worker` - per-provider task

pub mod addresses;
pub mod config;
pub mod engine;
pub mod worker;

pub use addresses::{AddressSupplier, ParsedAddressList};
pub use config::{ConfigError, RuntimeConfig};
pub use engine::{PairOutcome, PairState, ProviderTask, QueryOrchestrator, RunSummary};
