//! Host command execution broker.
//!
//! Every command the agent wants to run on the host flows through
//! [`ExecBroker::submit`]. The pipeline has three branches:
//!
//! - A matching deny rule mints a `denied` record immediately.
//! - A matching allow rule (never a blanket one; the evaluator vetoes
//!   those) runs the command right away under a synthetic id.
//! - Otherwise an `exec` permission request is queued and a continuation
//!   waits on its waiter: approval runs the command, denial closes the
//!   record.
//!
//! The exec category mode is structurally `approve-each`: the broker
//! never consults it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::runner::{self, RunOutput, DEFAULT_TIMEOUT};
use super::BrokerStatus;
use crate::config::ConfigStore;
use crate::queue::{Category, PermissionQueue};
use crate::rules::{self, Verdict};
use serde::{Deserialize, Serialize};

/// Lifecycle record for one submitted command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    /// `req-N` when human approval was required, otherwise
    /// `exec-auto-<ms>` / `exec-denied-<ms>`.
    pub id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: BrokerStatus,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

impl ExecRequest {
    fn new(id: String, command: String, cwd: Option<String>, reason: Option<String>) -> Self {
        Self {
            id,
            command,
            cwd,
            reason,
            status: BrokerStatus::Pending,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            created_at: Utc::now().timestamp_millis(),
            finished_at: None,
        }
    }
}

/// The exec broker: registry of [`ExecRequest`]s plus the submission
/// pipeline.
pub struct ExecBroker {
    registry: Mutex<HashMap<String, ExecRequest>>,
    queue: Arc<PermissionQueue>,
    config: Arc<ConfigStore>,
}

impl ExecBroker {
    pub fn new(queue: Arc<PermissionQueue>, config: Arc<ConfigStore>) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(HashMap::new()),
            queue,
            config,
        })
    }

    pub fn get(&self, id: &str) -> Option<ExecRequest> {
        self.registry.lock().unwrap().get(id).cloned()
    }

    /// Submit a command. Returns the record in its initial state; it
    /// progresses asynchronously (poll via [`ExecBroker::get`]).
    pub fn submit(
        self: &Arc<Self>,
        command: String,
        cwd: Option<String>,
        reason: Option<String>,
        timeout_ms: Option<u64>,
    ) -> ExecRequest {
        let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT);
        let now = Utc::now().timestamp_millis();

        match rules::evaluate(&self.config.rules(), Category::Exec, &command) {
            Some(Verdict::Deny) => {
                let mut record =
                    ExecRequest::new(format!("exec-denied-{}", now), command, cwd, reason);
                record.status = BrokerStatus::Denied;
                record.finished_at = Some(now);
                info!("Exec denied by rule: {}", record.command);
                self.insert(record.clone());
                record
            }
            Some(Verdict::Allow) => {
                let mut record =
                    ExecRequest::new(format!("exec-auto-{}", now), command, cwd, reason);
                record.status = BrokerStatus::Running;
                debug!("Exec auto-approved by rule: {}", record.command);
                self.insert(record.clone());
                self.spawn_run(record.id.clone(), timeout);
                record
            }
            None => {
                let mut metadata = Map::new();
                metadata.insert("command".to_string(), Value::from(command.clone()));
                if let Some(ref cwd) = cwd {
                    metadata.insert("cwd".to_string(), Value::from(cwd.clone()));
                }

                let (request, waiter) = self.queue.request(
                    Category::Exec,
                    command.clone(),
                    format!("Run command on host: {}", command),
                    reason.clone(),
                    metadata,
                );

                let record = ExecRequest::new(request.id.clone(), command, cwd, reason);
                self.insert(record.clone());

                let broker = Arc::clone(self);
                let id = request.id;
                tokio::spawn(async move {
                    let approved = waiter.await.unwrap_or(false);
                    if approved {
                        broker.update(&id, |r| r.status = BrokerStatus::Approved);
                        broker.run(&id, timeout).await;
                    } else {
                        broker.update(&id, |r| {
                            r.status = BrokerStatus::Denied;
                            r.finished_at = Some(Utc::now().timestamp_millis());
                        });
                    }
                });
                record
            }
        }
    }

    fn insert(&self, record: ExecRequest) {
        self.registry.lock().unwrap().insert(record.id.clone(), record);
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut ExecRequest)) {
        if let Some(record) = self.registry.lock().unwrap().get_mut(id) {
            f(record);
        }
    }

    fn spawn_run(self: &Arc<Self>, id: String, timeout: Duration) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            broker.run(&id, timeout).await;
        });
    }

    async fn run(&self, id: &str, timeout: Duration) {
        let Some((command, cwd)) = self
            .registry
            .lock()
            .unwrap()
            .get(id)
            .map(|r| (r.command.clone(), r.cwd.clone()))
        else {
            return;
        };

        self.update(id, |r| r.status = BrokerStatus::Running);
        let cwd = cwd.map(PathBuf::from);
        let output = runner::run_shell(&command, cwd.as_deref(), timeout).await;
        self.finish(id, output);
    }

    fn finish(&self, id: &str, output: RunOutput) {
        self.update(id, |r| {
            r.stdout = output.stdout;
            r.stderr = output.stderr;
            r.exit_code = Some(output.exit_code);
            r.finished_at = Some(Utc::now().timestamp_millis());
            // Timeouts and spawn failures are failures; a command that
            // ran to completion keeps its own exit code.
            r.status = if output.exit_code == runner::TIMEOUT_EXIT_CODE || output.exit_code == -1 {
                BrokerStatus::Failed
            } else {
                BrokerStatus::Completed
            };
        });
    }
}
