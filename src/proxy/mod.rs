//! Mediating network proxy.
//!
//! The agent's outbound HTTP(S) traffic arrives here (default port
//! 3701) in two shapes: CONNECT for HTTPS tunneling and absolute-form
//! requests for plain HTTP. Both run the same decision pipeline
//! (allowed endpoints, then rules, then the network category mode, then
//! the approval queue) before any byte leaves the sandbox. Approved
//! CONNECTs are piped blind; denials return a 403 naming the decision.

pub mod connect;
pub mod error;
pub mod policy;
pub mod server;

pub use error::ProxyError;
pub use policy::{ProxyDecision, ProxyPolicy};
pub use server::ProxyServer;
