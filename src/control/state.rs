//! Shared control-plane state and the approve/deny flows.
//!
//! Every REST handler and WebSocket command operates on [`AppState`].
//! The approve/deny flows live here rather than in the route layer
//! because the WebSocket command path runs the exact same logic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::brokers::{ExecBroker, PackageBroker};
use crate::config::{ConfigStore, RuleKind};
use crate::queue::{Category, PermissionQueue, PermissionRequest, RequestStatus, ResolvedBy};
use crate::rules::{self, RuleSet, Verdict};
use crate::sync::{FileSync, GitSync, LiveMirror};

/// Control-plane events that are not queue lifecycle events.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The rule lists changed.
    Rules(RuleSet),
    /// The server is shutting down.
    Shutdown { reason: String },
}

/// Everything the control plane needs, shared across handlers.
pub struct AppState {
    pub queue: Arc<PermissionQueue>,
    pub config: Arc<ConfigStore>,
    pub audit: AuditLog,
    pub exec: Arc<ExecBroker>,
    pub packages: Arc<PackageBroker>,
    pub files: Arc<FileSync>,
    pub git: GitSync,
    pub mirror: Arc<LiveMirror>,
    /// Agent workspace (mirror source).
    pub workspace: PathBuf,
    /// Host project directory (mirror destination).
    pub host_project: PathBuf,
    /// Wall-clock start, milliseconds.
    pub started_at_ms: i64,
    pub started_at: Instant,
    pub max_uptime_ms: Option<u64>,
    /// Process-wide shutdown signal (proxy, mirror, server loops).
    pub shutdown_tx: watch::Sender<bool>,
    /// Fan-out for rules/shutdown events to WebSocket clients.
    pub events: broadcast::Sender<ServerEvent>,
}

/// Failure modes of the approve flow that map to HTTP statuses.
#[derive(Debug)]
pub enum ApproveError {
    /// Unknown request id, or the request is no longer pending.
    NotPending,
    /// A filesystem apply failed; the request has been denied.
    Conflict(String),
}

impl AppState {
    pub fn broadcast_rules(&self) {
        let _ = self.events.send(ServerEvent::Rules(self.config.rules()));
    }

    /// Approve a request.
    ///
    /// For filesystem requests the proposed change is applied first; a
    /// stale apply denies the request and reports a conflict. Sandbox
    /// approvals apply the embedded config proposal. With
    /// `always_allow`, a covering allow rule is synthesized, persisted,
    /// broadcast, and any pending requests it now covers are resolved as
    /// `auto`.
    pub fn approve(
        &self,
        id: &str,
        resolved_by: ResolvedBy,
        always_allow: bool,
    ) -> Result<(), ApproveError> {
        let Some(request) = self.queue.get(id) else {
            return Err(ApproveError::NotPending);
        };
        if request.status != RequestStatus::Pending {
            return Err(ApproveError::NotPending);
        }

        // Apply filesystem edits before flipping the status: a stale
        // edit must deny, not approve.
        if request.category == Category::Filesystem && request.metadata.contains_key("toolName") {
            if let Err(error) = self.files.apply_filesystem_request(&request) {
                warn!("Filesystem apply failed for {}: {}", id, error);
                self.queue.deny(id, resolved_by);
                return Err(ApproveError::Conflict(error));
            }
        }

        if !self.queue.approve(id, resolved_by) {
            return Err(ApproveError::NotPending);
        }

        if request.category == Category::Sandbox {
            self.apply_sandbox_proposal(&request);
        }

        if always_allow {
            let rule = rules::generate(request.category, &request.action);
            if self.config.add_rule(RuleKind::Allow, &rule) {
                info!("Added allow rule {:?} via Always Allow", rule);
                if let Err(e) = self.config.save() {
                    warn!("Failed to persist config: {}", e);
                }
                self.broadcast_rules();
                self.auto_resolve_matching();
            }
        }

        Ok(())
    }

    /// Deny a request, optionally persisting a covering deny rule and
    /// auto-resolving pending requests it now covers.
    pub fn deny(&self, id: &str, resolved_by: ResolvedBy, always_deny: bool) -> bool {
        let request = self.queue.get(id);
        if !self.queue.deny(id, resolved_by) {
            return false;
        }

        if always_deny {
            if let Some(request) = request {
                let rule = rules::generate(request.category, &request.action);
                if self.config.add_rule(RuleKind::Deny, &rule) {
                    info!("Added deny rule {:?} via Always Deny", rule);
                    if let Err(e) = self.config.save() {
                        warn!("Failed to persist config: {}", e);
                    }
                    self.broadcast_rules();
                    self.auto_resolve_matching();
                }
            }
        }

        true
    }

    fn apply_sandbox_proposal(&self, request: &PermissionRequest) {
        let Some(proposal) = request.metadata.get("proposal").and_then(|v| v.as_object()) else {
            return;
        };
        let Some(path) = proposal.get("path").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(value) = proposal.get("value") else {
            return;
        };

        match self.config.apply_config_change(path, value.clone()) {
            Ok(()) => {
                info!("Applied sandbox proposal: {} = {}", path, value);
                if let Err(e) = self.config.save() {
                    warn!("Failed to persist config: {}", e);
                }
            }
            Err(e) => warn!("Sandbox proposal for {} rejected: {}", path, e),
        }
    }

    /// Re-evaluate every pending request against the current rules and
    /// resolve the ones a rule now decides, as `auto`.
    pub fn auto_resolve_matching(&self) {
        let ruleset = self.config.rules();
        for request in self.queue.pending() {
            let target = rule_target(&request);
            match rules::evaluate(&ruleset, request.category, &target) {
                Some(Verdict::Allow) => {
                    // Run the full approve pipeline so filesystem edits
                    // still apply; a stale apply denies instead.
                    let _ = self.approve(&request.id, ResolvedBy::Auto, false);
                }
                Some(Verdict::Deny) => {
                    self.queue.deny(&request.id, ResolvedBy::Auto);
                }
                None => {}
            }
        }
    }
}

/// The string a request's category matches rules against.
///
/// This mirrors what each subsystem used when it consulted the rules on
/// the way in: the bare host for network, the target file for
/// filesystem, the branch for git, the verbatim action elsewhere.
pub fn rule_target(request: &PermissionRequest) -> String {
    match request.category {
        Category::Network => rules::extract_network_host(&request.action)
            .unwrap_or_else(|| request.action.clone()),
        Category::Filesystem => request
            .target_file()
            .map(str::to_string)
            .unwrap_or_else(|| {
                request
                    .action
                    .strip_prefix("sync ")
                    .unwrap_or(&request.action)
                    .to_string()
            }),
        Category::Git => request
            .action
            .strip_prefix("push ")
            .unwrap_or(&request.action)
            .to_string(),
        _ => request.action.clone(),
    }
}
