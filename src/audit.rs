//! Append-only JSONL audit trail.
//!
//! Every queue resolution (and every proxy bypass of the allowlist) is
//! recorded as one JSON object per line in `data/audit.log`. The audit
//! log is strictly best-effort: appends swallow all I/O failures so that
//! a full disk or missing directory can never block a decision path.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::queue::{Category, ResolvedBy};

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Wall-clock milliseconds.
    pub timestamp: i64,
    pub id: String,
    pub category: Category,
    pub action: String,
    /// `approved`, `denied`, or `allow` for allowlist bypasses.
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<ResolvedBy>,
    /// Milliseconds the request spent pending, when it waited at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Handle to the audit log file.
///
/// A `null()` log discards every entry; tests and early-startup callers
/// use it so audit wiring never becomes a precondition.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    /// An audit log that discards all entries.
    pub fn null() -> Self {
        Self { path: None }
    }

    /// Append one entry. Failures are swallowed.
    pub fn append(&self, entry: &AuditEntry) {
        let Some(ref path) = self.path else {
            return;
        };

        let Ok(line) = serde_json::to_string(entry) else {
            return;
        };

        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let _ = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", line));
    }

    /// Read up to `limit` entries, most recent first.
    ///
    /// Malformed lines are skipped; a missing file yields an empty list.
    pub fn read(&self, limit: usize) -> Vec<AuditEntry> {
        let Some(ref path) = self.path else {
            return Vec::new();
        };

        let Ok(contents) = fs::read_to_string(path) else {
            return Vec::new();
        };

        let mut entries: Vec<AuditEntry> = contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        entries.reverse();
        entries.truncate(limit);
        entries
    }
}
