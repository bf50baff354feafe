//! Core data types for the permission queue.
//!
//! Every mediated action becomes a [`PermissionRequest`] in one of six
//! [`Category`]s. Requests move through a single transition:
//! `pending -> approved | denied`. Terminal states are sticky.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The six mediation buckets. Every request belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Outbound HTTP(S) connections through the proxy.
    Network,
    /// Workspace file exports to the host.
    Filesystem,
    /// Pushes from the staging repo to the real remote.
    Git,
    /// Package manager installs/removals (hardened).
    Packages,
    /// Agent-proposed sandbox configuration changes.
    Sandbox,
    /// Host command execution (hardened).
    Exec,
}

impl Category {
    /// All categories, in display order.
    pub const ALL: [Category; 6] = [
        Category::Network,
        Category::Filesystem,
        Category::Git,
        Category::Packages,
        Category::Sandbox,
        Category::Exec,
    ];

    /// Hardened categories are locked to `approve-each` and blanket allow
    /// rules for them are ignored during evaluation.
    pub fn is_hardened(self) -> bool {
        matches!(self, Category::Exec | Category::Packages)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Network => "network",
            Category::Filesystem => "filesystem",
            Category::Git => "git",
            Category::Packages => "packages",
            Category::Sandbox => "sandbox",
            Category::Exec => "exec",
        }
    }
}

impl std::str::FromStr for Category {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(Category::Network),
            "filesystem" => Ok(Category::Filesystem),
            "git" => Ok(Category::Git),
            "packages" => Ok(Category::Packages),
            "sandbox" => Ok(Category::Sandbox),
            "exec" => Ok(Category::Exec),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
}

/// Who resolved a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedBy {
    /// Operator CLI.
    Cli,
    /// Web dashboard / WebSocket client.
    Web,
    /// Rule match, supersession, or shutdown.
    Auto,
}

impl std::str::FromStr for ResolvedBy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cli" => Ok(ResolvedBy::Cli),
            "web" => Ok(ResolvedBy::Web),
            "auto" => Ok(ResolvedBy::Auto),
            _ => Err(()),
        }
    }
}

/// A single mediated action awaiting (or having received) a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Sequential id of the form `req-N`.
    pub id: String,
    pub category: Category,
    /// Short machine-readable verb + target (e.g. `CONNECT host:443`).
    /// This is the string rules are matched against.
    pub action: String,
    /// Longer human-readable sentence for display.
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: RequestStatus,
    /// Open key/value bag. Filesystem requests carry `toolName`,
    /// `targetFile` and edit payloads; sandbox requests carry `proposal`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Wall-clock milliseconds.
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<ResolvedBy>,
}

impl PermissionRequest {
    /// Create a fresh pending request stamped with the current time.
    pub fn new(
        id: String,
        category: Category,
        action: String,
        description: String,
        reason: Option<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id,
            category,
            action,
            description,
            reason,
            status: RequestStatus::Pending,
            metadata,
            created_at: Utc::now().timestamp_millis(),
            resolved_at: None,
            resolved_by: None,
        }
    }

    /// The `metadata.targetFile` value, when present (filesystem requests).
    pub fn target_file(&self) -> Option<&str> {
        self.metadata.get("targetFile").and_then(Value::as_str)
    }
}

/// Lifecycle events broadcast by the queue.
///
/// For any given id the `Request` event is emitted before the `Resolve`
/// event, and both precede the waiter's completion.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A new request was inserted (always pending).
    Request(PermissionRequest),
    /// A request transitioned out of pending.
    Resolve(PermissionRequest),
}
