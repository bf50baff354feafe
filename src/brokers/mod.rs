//! Hardened subrequest brokers for host command execution and package
//! management, plus the shared subprocess runner.

pub mod exec;
pub mod packages;
pub mod runner;

use serde::{Deserialize, Serialize};

pub use exec::{ExecBroker, ExecRequest};
pub use packages::{
    build_command, parse_package_command, PackageBroker, PackageRequest, ParsedPackageCommand,
};
pub use runner::{run_shell, RunOutput, DEFAULT_TIMEOUT, TIMEOUT_EXIT_CODE};

/// Lifecycle state shared by exec and package records.
///
/// `pending -> approved -> running -> completed | failed`, or
/// `pending -> denied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    Pending,
    Approved,
    Running,
    Completed,
    Failed,
    Denied,
}
