//! Sandbox configuration: schema, persistence, and the process-wide
//! store with hardened-category invariants.

pub mod error;
pub mod schema;
pub mod store;

pub use error::ConfigError;
pub use schema::{CategoryMode, CategoryPolicy, SandboxConfig};
pub use store::{ConfigStore, RuleKind};
