//! Package manager broker.
//!
//! Parallel to the exec broker, with two extra defenses: the submitted
//! command line is parsed into `{manager, action, packages, flags}`, and
//! flags pass through a whitelist: anything unknown (say,
//! `--registry=evil.com`) is dropped silently and never reaches the
//! shell. The command that actually runs is rebuilt from the parsed
//! parts, so nothing survives the round trip except what we recognize.
//!
//! Like exec, the packages category mode is structurally `approve-each`
//! and blanket `packages(*)` allow rules are ignored by the evaluator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::runner::{self, RunOutput, DEFAULT_TIMEOUT};
use super::BrokerStatus;
use crate::config::ConfigStore;
use crate::queue::{Category, PermissionQueue};
use crate::rules::{self, Verdict};

/// Flags that may pass through to the package manager. Everything else
/// is dropped.
const ALLOWED_FLAGS: &[&str] = &[
    "-D",
    "--dev",
    "--save-dev",
    "-E",
    "--exact",
    "-g",
    "--global",
    "--save",
    "--save-exact",
];

/// A recognized package-manager command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedPackageCommand {
    pub manager: String,
    pub action: String,
    pub packages: Vec<String>,
    pub flags: Vec<String>,
}

/// Lifecycle record for one package operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRequest {
    /// `req-N` when human approval was required, otherwise
    /// `pkg-auto-<ms>` / `pkg-denied-<ms>`.
    pub id: String,
    pub manager: String,
    pub action: String,
    pub packages: Vec<String>,
    pub flags: Vec<String>,
    /// The canonical command actually run.
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

/// Parse a raw package-manager command line.
///
/// Recognized forms (each with at least one package):
/// - `bun add|remove <pkgs…>`
/// - `npm install|i|uninstall <pkgs…>`
/// - `pip|pip3 install|uninstall <pkgs…>`
/// - `cargo add|remove <pkgs…>`
///
/// Unknown flags are filtered out, not rejected.
pub fn parse_package_command(cmdline: &str) -> Option<ParsedPackageCommand> {
    let mut tokens = cmdline.split_whitespace();
    let manager = match tokens.next()? {
        "pip3" => "pip".to_string(),
        m @ ("bun" | "npm" | "pip" | "cargo") => m.to_string(),
        _ => return None,
    };

    let action = match (manager.as_str(), tokens.next()?) {
        ("bun", a @ ("add" | "remove")) => a.to_string(),
        ("npm", "i") => "install".to_string(),
        ("npm", a @ ("install" | "uninstall")) => a.to_string(),
        ("pip", a @ ("install" | "uninstall")) => a.to_string(),
        ("cargo", a @ ("add" | "remove")) => a.to_string(),
        _ => return None,
    };

    let mut packages = Vec::new();
    let mut flags = Vec::new();
    for token in tokens {
        if token.starts_with('-') {
            if ALLOWED_FLAGS.contains(&token) {
                flags.push(token.to_string());
            }
            // Unknown flag: dropped silently.
        } else {
            packages.push(token.to_string());
        }
    }

    if packages.is_empty() {
        return None;
    }

    Some(ParsedPackageCommand {
        manager,
        action,
        packages,
        flags,
    })
}

/// Rebuild the canonical command string for a manager/action pair.
///
/// Actions are normalized to the manager's own verb: add/remove for bun
/// and cargo, install/uninstall for npm and pip.
pub fn build_command(manager: &str, action: &str, packages: &[String], flags: &[String]) -> String {
    let verb = normalize_action(manager, action);
    let mut parts = vec![manager.to_string(), verb.to_string()];
    parts.extend(flags.iter().cloned());
    parts.extend(packages.iter().cloned());
    parts.join(" ")
}

fn normalize_action(manager: &str, action: &str) -> &'static str {
    let removing = matches!(action, "remove" | "uninstall");
    match (manager, removing) {
        ("bun" | "cargo", false) => "add",
        ("bun" | "cargo", true) => "remove",
        (_, false) => "install",
        (_, true) => "uninstall",
    }
}

/// The package broker.
pub struct PackageBroker {
    registry: Mutex<HashMap<String, PackageRequest>>,
    queue: Arc<PermissionQueue>,
    config: Arc<ConfigStore>,
}

impl PackageBroker {
    pub fn new(queue: Arc<PermissionQueue>, config: Arc<ConfigStore>) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(HashMap::new()),
            queue,
            config,
        })
    }

    pub fn get(&self, id: &str) -> Option<PackageRequest> {
        self.registry.lock().unwrap().get(id).cloned()
    }

    /// Submit a package operation. The rule match target is
    /// `"<manager> <action> <pkg1> <pkg2>…"` (flags excluded).
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        self: &Arc<Self>,
        manager: &str,
        packages: Vec<String>,
        action: &str,
        flags: Vec<String>,
        reason: Option<String>,
        cwd: Option<String>,
        timeout_ms: Option<u64>,
    ) -> Option<PackageRequest> {
        if packages.is_empty() {
            return None;
        }
        let manager = if manager == "pip3" { "pip" } else { manager };
        if !matches!(manager, "bun" | "npm" | "pip" | "cargo") {
            return None;
        }
        let action = normalize_action(manager, action).to_string();
        let flags: Vec<String> = flags
            .into_iter()
            .filter(|f| ALLOWED_FLAGS.contains(&f.as_str()))
            .collect();

        let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT);
        let target = format!("{} {} {}", manager, action, packages.join(" "));
        let command = build_command(manager, &action, &packages, &flags);
        let now = Utc::now().timestamp_millis();

        let make = |id: String| PackageRequest {
            id,
            manager: manager.to_string(),
            action: action.clone(),
            packages: packages.clone(),
            flags: flags.clone(),
            command: command.clone(),
            cwd: cwd.clone(),
            reason: reason.clone(),
            status: BrokerStatus::Pending,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            created_at: now,
            finished_at: None,
        };

        match rules::evaluate(&self.config.rules(), Category::Packages, &target) {
            Some(Verdict::Deny) => {
                let mut record = make(format!("pkg-denied-{}", now));
                record.status = BrokerStatus::Denied;
                record.finished_at = Some(now);
                info!("Package request denied by rule: {}", target);
                self.insert(record.clone());
                Some(record)
            }
            Some(Verdict::Allow) => {
                let mut record = make(format!("pkg-auto-{}", now));
                record.status = BrokerStatus::Running;
                debug!("Package request auto-approved by rule: {}", target);
                self.insert(record.clone());
                self.spawn_run(record.id.clone(), timeout);
                Some(record)
            }
            None => {
                let mut metadata = Map::new();
                metadata.insert("manager".to_string(), Value::from(manager));
                metadata.insert("action".to_string(), Value::from(action.clone()));
                metadata.insert(
                    "packages".to_string(),
                    Value::from(packages.clone()),
                );
                metadata.insert("command".to_string(), Value::from(command.clone()));

                let (request, waiter) = self.queue.request(
                    Category::Packages,
                    target,
                    format!("Install/remove packages: {}", command),
                    reason.clone(),
                    metadata,
                );

                let record = make(request.id.clone());
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
                Some(record)
            }
        }
    }

    fn insert(&self, record: PackageRequest) {
        self.registry.lock().unwrap().insert(record.id.clone(), record);
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut PackageRequest)) {
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
            r.status = if output.exit_code == runner::TIMEOUT_EXIT_CODE || output.exit_code == -1 {
                BrokerStatus::Failed
            } else {
                BrokerStatus::Completed
            };
        });
    }
}
