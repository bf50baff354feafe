//! Sandbox configuration schema.
//!
//! The configuration is persisted as pretty-printed JSON at
//! `sandbox.config.json`. Older files may lack the `rules` section; it
//! is patched in on load.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::queue::Category;
use crate::rules::RuleSet;

/// Per-category approval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CategoryMode {
    /// Queue every request for a human decision.
    ApproveEach,
    /// Requests pass through; decisions happen in bulk via the UI.
    ApproveBulk,
    /// Everything in the category is permitted.
    AllowAll,
    /// Everything in the category is refused.
    DenyAll,
}

impl std::str::FromStr for CategoryMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve-each" => Ok(CategoryMode::ApproveEach),
            "approve-bulk" => Ok(CategoryMode::ApproveBulk),
            "allow-all" => Ok(CategoryMode::AllowAll),
            "deny-all" => Ok(CategoryMode::DenyAll),
            _ => Err(()),
        }
    }
}

/// Policy wrapper for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPolicy {
    pub mode: CategoryMode,
}

/// The full persisted sandbox configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Host suffixes the proxy lets through without queueing.
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,

    /// Filesystem path of the bare staging repository.
    #[serde(default = "default_git_staging_repo")]
    pub git_staging_repo: String,

    /// Per-category approval modes.
    #[serde(default = "default_categories")]
    pub categories: BTreeMap<Category, CategoryPolicy>,

    /// Auto-allow / auto-deny rules.
    #[serde(default)]
    pub rules: RuleSet,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_endpoints: default_allowed_endpoints(),
            git_staging_repo: default_git_staging_repo(),
            categories: default_categories(),
            rules: RuleSet::default(),
        }
    }
}

impl SandboxConfig {
    /// Re-assert structural invariants after deserialization or a raw
    /// config mutation: every category has a mode entry, and the hardened
    /// categories read `approve-each` no matter what was persisted.
    pub fn normalize(&mut self) {
        for category in Category::ALL {
            let entry = self.categories.entry(category).or_insert(CategoryPolicy {
                mode: CategoryMode::ApproveEach,
            });
            if category.is_hardened() {
                entry.mode = CategoryMode::ApproveEach;
            }
        }
    }
}

fn default_git_staging_repo() -> String {
    "/workspace/staging.git".to_string()
}

/// Endpoints the agent needs to function at all (its own model API).
fn default_allowed_endpoints() -> Vec<String> {
    vec![
        "api.anthropic.com".to_string(),
        "statsig.anthropic.com".to_string(),
        "sentry.io".to_string(),
    ]
}

fn default_categories() -> BTreeMap<Category, CategoryPolicy> {
    Category::ALL
        .into_iter()
        .map(|c| {
            (
                c,
                CategoryPolicy {
                    mode: CategoryMode::ApproveEach,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_covers_all_categories() {
        let config = SandboxConfig::default();
        for category in Category::ALL {
            assert!(config.categories.contains_key(&category));
        }
    }

    #[test]
    fn test_mode_serializes_kebab_case() {
        let json = serde_json::to_string(&CategoryMode::ApproveEach).unwrap();
        assert_eq!(json, "\"approve-each\"");
        let json = serde_json::to_string(&CategoryMode::AllowAll).unwrap();
        assert_eq!(json, "\"allow-all\"");
    }

    #[test]
    fn test_missing_rules_section_is_patched() {
        let json = r#"{
            "allowedEndpoints": ["api.anthropic.com"],
            "gitStagingRepo": "/tmp/staging.git",
            "categories": {"network": {"mode": "allow-all"}}
        }"#;

        let mut config: SandboxConfig = serde_json::from_str(json).unwrap();
        config.normalize();

        assert!(config.rules.allow.is_empty());
        assert!(config.rules.deny.is_empty());
        // Missing categories filled in as approve-each
        assert_eq!(
            config.categories[&Category::Exec].mode,
            CategoryMode::ApproveEach
        );
        // Present ones preserved
        assert_eq!(
            config.categories[&Category::Network].mode,
            CategoryMode::AllowAll
        );
    }

    #[test]
    fn test_normalize_forces_hardened_modes() {
        let json = r#"{
            "categories": {
                "exec": {"mode": "allow-all"},
                "packages": {"mode": "deny-all"}
            }
        }"#;

        let mut config: SandboxConfig = serde_json::from_str(json).unwrap();
        config.normalize();

        assert_eq!(
            config.categories[&Category::Exec].mode,
            CategoryMode::ApproveEach
        );
        assert_eq!(
            config.categories[&Category::Packages].mode,
            CategoryMode::ApproveEach
        );
    }
}
