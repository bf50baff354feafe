//! Process-wide configuration store.
//!
//! The store owns the in-memory [`SandboxConfig`] behind a `RwLock` with
//! an explicit `load`/`save` lifecycle. Queries go through pass-through
//! accessors; mutation is funneled through the control plane so that
//! persistence and event broadcast happen together.
//!
//! Two invariants are enforced here independently of the rule evaluator:
//! the `exec` and `packages` category modes always read `approve-each`,
//! and writes attempting to change them are silently discarded.

use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use serde_json::Value;
use tracing::{debug, warn};

use super::error::ConfigError;
use super::schema::{CategoryMode, SandboxConfig};
use crate::queue::Category;
use crate::rules::{self, RuleSet};

/// Which rule list a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Allow,
    Deny,
}

impl std::str::FromStr for RuleKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(RuleKind::Allow),
            "deny" => Ok(RuleKind::Deny),
            _ => Err(()),
        }
    }
}

/// The sandbox configuration store.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<SandboxConfig>,
}

impl ConfigStore {
    /// Create a store backed by `path`, initialized with built-in
    /// defaults. Call [`ConfigStore::load`] to pick up persisted state.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            inner: RwLock::new(SandboxConfig::default()),
        }
    }

    /// Load the persisted config into memory.
    ///
    /// A missing file keeps the defaults. A file that fails to parse is
    /// logged and ignored: the server continues on defaults rather than
    /// refusing to start.
    pub fn load(&self) {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {:?}, using defaults", self.path);
                return;
            }
            Err(e) => {
                warn!("Failed to read config {:?}: {}", self.path, e);
                return;
            }
        };

        match serde_json::from_str::<SandboxConfig>(&contents) {
            Ok(mut config) => {
                config.normalize();
                *self.inner.write().unwrap() = config;
                debug!("Loaded config from {:?}", self.path);
            }
            Err(e) => {
                warn!(
                    "Config file {:?} is invalid ({}), using defaults",
                    self.path, e
                );
            }
        }
    }

    /// Persist the current config as pretty JSON with a trailing newline.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config = self.inner.read().unwrap().clone();
        let mut contents =
            serde_json::to_string_pretty(&config).expect("config serialization cannot fail");
        contents.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        fs::write(&self.path, contents).map_err(|e| ConfigError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Snapshot the full config.
    pub fn get(&self) -> SandboxConfig {
        self.inner.read().unwrap().clone()
    }

    /// Snapshot the rule lists.
    pub fn rules(&self) -> RuleSet {
        self.inner.read().unwrap().rules.clone()
    }

    /// True when `host` equals an allowed endpoint or ends with
    /// `.<endpoint>`. Case-insensitive.
    pub fn is_endpoint_allowed(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.inner
            .read()
            .unwrap()
            .allowed_endpoints
            .iter()
            .any(|endpoint| {
                let endpoint = endpoint.to_lowercase();
                host == endpoint || host.ends_with(&format!(".{}", endpoint))
            })
    }

    /// Read the effective mode for a category. Hardened categories
    /// always report `approve-each`.
    pub fn category_mode(&self, category: Category) -> CategoryMode {
        if category.is_hardened() {
            return CategoryMode::ApproveEach;
        }
        self.inner
            .read()
            .unwrap()
            .categories
            .get(&category)
            .map(|p| p.mode)
            .unwrap_or(CategoryMode::ApproveEach)
    }

    /// Set the mode for a category. Attempts to move a hardened category
    /// off `approve-each` are silently discarded.
    pub fn set_category_mode(&self, category: Category, mode: CategoryMode) {
        if category.is_hardened() && mode != CategoryMode::ApproveEach {
            debug!(
                "Ignoring mode change for hardened category {}: {:?}",
                category, mode
            );
            return;
        }
        if let Some(policy) = self.inner.write().unwrap().categories.get_mut(&category) {
            policy.mode = mode;
        }
    }

    /// Insert a rule. Returns false (and changes nothing) when the rule
    /// does not parse or is already present.
    pub fn add_rule(&self, kind: RuleKind, rule: &str) -> bool {
        if rules::parse(rule).is_none() {
            return false;
        }

        let mut inner = self.inner.write().unwrap();
        let list = match kind {
            RuleKind::Allow => &mut inner.rules.allow,
            RuleKind::Deny => &mut inner.rules.deny,
        };
        if list.iter().any(|r| r == rule) {
            return false;
        }
        list.push(rule.to_string());
        true
    }

    /// Remove a rule. Returns whether it was present.
    pub fn remove_rule(&self, kind: RuleKind, rule: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let list = match kind {
            RuleKind::Allow => &mut inner.rules.allow,
            RuleKind::Deny => &mut inner.rules.deny,
        };
        let before = list.len();
        list.retain(|r| r != rule);
        list.len() != before
    }

    /// Append a host suffix to the network bypass list.
    pub fn add_allowed_endpoint(&self, endpoint: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.allowed_endpoints.iter().any(|e| e == endpoint) {
            return false;
        }
        inner.allowed_endpoints.push(endpoint.to_string());
        true
    }

    /// Remove a host suffix from the network bypass list.
    pub fn remove_allowed_endpoint(&self, endpoint: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let before = inner.allowed_endpoints.len();
        inner.allowed_endpoints.retain(|e| e != endpoint);
        inner.allowed_endpoints.len() != before
    }

    /// Apply an approved agent-proposed change: walk the dot-separated
    /// `path` through the config document and assign `value`.
    ///
    /// The mutated document must still deserialize as a valid config;
    /// hardened category modes are re-normalized afterwards.
    pub fn apply_config_change(&self, path: &str, value: Value) -> Result<(), ConfigError> {
        let mut inner = self.inner.write().unwrap();
        let mut doc = serde_json::to_value(&*inner).expect("config serialization cannot fail");

        let mut cursor = &mut doc;
        let segments: Vec<&str> = path.split('.').collect();
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| ConfigError::UnknownPath(path.to_string()))?;

        for segment in parents {
            cursor = cursor
                .as_object_mut()
                .and_then(|map| map.get_mut(*segment))
                .ok_or_else(|| ConfigError::UnknownPath(path.to_string()))?;
        }

        cursor
            .as_object_mut()
            .ok_or_else(|| ConfigError::UnknownPath(path.to_string()))?
            .insert(last.to_string(), value);

        let mut updated: SandboxConfig =
            serde_json::from_value(doc).map_err(|e| ConfigError::InvalidValue {
                path: path.to_string(),
                source: e,
            })?;
        updated.normalize();
        *inner = updated;
        Ok(())
    }
}
