//! Shared decision pipeline for proxied connections.
//!
//! Both the CONNECT path and the plain-HTTP path funnel through
//! [`ProxyPolicy::authorize`]:
//!
//! 1. Allowed endpoints (host suffix match) pass immediately: audited,
//!    never queued.
//! 2. Network rules: first matching deny refuses, first matching allow
//!    passes.
//! 3. The network category mode: `allow-all` and `approve-bulk` pass
//!    (bulk approvals are an operator-UI decision, not a per-connection
//!    gate), `deny-all` refuses, `approve-each` queues a request and
//!    suspends until the operator (or shutdown) decides.
//!
//! The returned denial message becomes the 403 body, citing the request
//! id when a queued decision was involved.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Map;
use tracing::{debug, info};

use crate::audit::{AuditEntry, AuditLog};
use crate::config::{CategoryMode, ConfigStore};
use crate::queue::{Category, PermissionQueue, ResolvedBy};
use crate::rules::{self, Verdict};

/// Outcome of the proxy decision pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyDecision {
    /// Forward the connection.
    Allow,
    /// Refuse with a 403 carrying this message.
    Deny(String),
}

/// The proxy's policy evaluator.
pub struct ProxyPolicy {
    config: Arc<ConfigStore>,
    queue: Arc<PermissionQueue>,
    audit: AuditLog,
}

impl ProxyPolicy {
    pub fn new(config: Arc<ConfigStore>, queue: Arc<PermissionQueue>, audit: AuditLog) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            audit,
        })
    }

    /// Decide whether a connection to `host` may proceed.
    ///
    /// `action` is the queue/rule-facing form (`CONNECT host:port` or
    /// `METHOD url`); `description` is shown to the operator. May
    /// suspend indefinitely while a queued request awaits a decision.
    pub async fn authorize(&self, host: &str, action: String, description: String) -> ProxyDecision {
        if self.config.is_endpoint_allowed(host) {
            debug!("Allowed endpoint bypass for {}", host);
            self.audit.append(&AuditEntry {
                timestamp: Utc::now().timestamp_millis(),
                id: "allowlist".to_string(),
                category: Category::Network,
                action,
                decision: "allow".to_string(),
                resolved_by: Some(ResolvedBy::Auto),
                duration_ms: None,
                metadata: None,
            });
            return ProxyDecision::Allow;
        }

        match rules::evaluate(&self.config.rules(), Category::Network, host) {
            Some(Verdict::Deny) => {
                info!("Connection to {} denied by rule", host);
                return ProxyDecision::Deny(format!("Denied by sandbox (deny rule for {})", host));
            }
            Some(Verdict::Allow) => {
                debug!("Connection to {} allowed by rule", host);
                return ProxyDecision::Allow;
            }
            None => {}
        }

        match self.config.category_mode(Category::Network) {
            CategoryMode::AllowAll | CategoryMode::ApproveBulk => ProxyDecision::Allow,
            CategoryMode::DenyAll => {
                info!("Connection to {} denied by deny-all mode", host);
                ProxyDecision::Deny("Denied by sandbox (network deny-all)".to_string())
            }
            CategoryMode::ApproveEach => {
                let (request, waiter) = self.queue.request(
                    Category::Network,
                    action,
                    description,
                    None,
                    Map::new(),
                );
                info!(
                    "Connection to {} waiting on request {}",
                    host, request.id
                );
                match waiter.await {
                    Ok(true) => ProxyDecision::Allow,
                    _ => ProxyDecision::Deny(format!(
                        "Denied by sandbox (request {})",
                        request.id
                    )),
                }
            }
        }
    }
}
