//! Rule parsing, matching, and evaluation.
//!
//! Rules are strings of the form `category(pattern)`; a bare `category`
//! is shorthand for `category(*)`. They express auto-allow or auto-deny
//! decisions that short-circuit the human approval queue.
//!
//! # Evaluation Order
//!
//! 1. Deny rules, in insertion order; first match wins.
//! 2. Allow rules, in insertion order; first match wins. Blanket
//!    `exec(*)` / `packages(*)` allow rules are skipped here: a rule
//!    that would wave through arbitrary commands is ignored rather than
//!    honored.
//! 3. Neither bucket matched: the caller falls through to the category
//!    mode.
//!
//! # Pattern Matching
//!
//! Filesystem patterns are path-aware globs: `*` matches a single path
//! segment, `**` matches zero or more. All other categories use
//! shell-style globs where `*` matches any run of characters, including
//! `/` and spaces.
//!
//! This module is pure: no I/O, no global state.

use globset::GlobBuilder;
use serde::{Deserialize, Serialize};

use crate::queue::Category;

/// Persisted rule lists, deny and allow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// A rule string decomposed into its category and pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRule {
    pub category: Category,
    pub pattern: String,
}

/// Outcome of rule evaluation. `None` from [`evaluate`] means no rule
/// matched and the category mode decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// Parse a rule string.
///
/// Accepts `category(pattern)` with a non-empty pattern, and a bare
/// `category` (equivalent to `category(*)`). Returns `None` for unknown
/// categories, empty patterns, or malformed syntax.
pub fn parse(rule: &str) -> Option<ParsedRule> {
    let rule = rule.trim();
    if rule.is_empty() {
        return None;
    }

    match rule.split_once('(') {
        Some((cat, rest)) => {
            let pattern = rest.strip_suffix(')')?;
            if pattern.is_empty() {
                return None;
            }
            let category: Category = cat.trim().parse().ok()?;
            Some(ParsedRule {
                category,
                pattern: pattern.to_string(),
            })
        }
        None => {
            let category: Category = rule.parse().ok()?;
            Some(ParsedRule {
                category,
                pattern: "*".to_string(),
            })
        }
    }
}

/// Match a pattern against a target using the category's glob dialect.
///
/// Patterns that fail to compile match nothing.
pub fn pattern_matches(pattern: &str, target: &str, category: Category) -> bool {
    let path_aware = category == Category::Filesystem;
    let glob = GlobBuilder::new(pattern)
        .literal_separator(path_aware)
        .build();
    match glob {
        Ok(glob) => glob.compile_matcher().is_match(target),
        Err(_) => false,
    }
}

/// Evaluate a target against the rule set for a category.
///
/// Deny rules are checked first; within each bucket the first matching
/// rule (in insertion order) wins. Returns `None` when nothing matched.
pub fn evaluate(rules: &RuleSet, category: Category, target: &str) -> Option<Verdict> {
    for rule in &rules.deny {
        if let Some(parsed) = parse(rule) {
            if parsed.category == category && pattern_matches(&parsed.pattern, target, category) {
                return Some(Verdict::Deny);
            }
        }
    }

    for rule in &rules.allow {
        if let Some(parsed) = parse(rule) {
            // A blanket allow on a hardened category is too dangerous to
            // honor; skip it without erroring.
            if parsed.category.is_hardened() && parsed.pattern == "*" {
                continue;
            }
            if parsed.category == category && pattern_matches(&parsed.pattern, target, category) {
                return Some(Verdict::Allow);
            }
        }
    }

    None
}

/// Generate a rule string covering an action, for "Always Allow/Deny".
///
/// The generated rule is deliberately broader than the single action for
/// network (whole apex domain) and filesystem (whole directory), and
/// verbatim for everything else.
pub fn generate(category: Category, action: &str) -> String {
    match category {
        Category::Network => {
            let host = match extract_network_host(action) {
                Some(host) => host,
                None => return format!("network({})", action),
            };
            if is_ipv4_literal(&host) {
                return format!("network({})", host);
            }
            let labels: Vec<&str> = host.split('.').collect();
            if labels.len() > 2 {
                let apex = labels[labels.len() - 2..].join(".");
                format!("network(*.{})", apex)
            } else {
                format!("network({})", host)
            }
        }
        Category::Filesystem => {
            let path = action.strip_prefix("sync ").unwrap_or(action);
            match path.rsplit_once('/') {
                Some((dir, _)) => format!("filesystem({}/*)", dir),
                None => format!("filesystem({})", path),
            }
        }
        Category::Git => {
            let branch = action.strip_prefix("push ").unwrap_or(action);
            format!("git({})", branch)
        }
        Category::Exec | Category::Packages | Category::Sandbox => {
            format!("{}({})", category, action)
        }
    }
}

/// Extract the bare host from a network action string.
///
/// Handles `CONNECT host[:port]` and `METHOD scheme://host[:port]/path`.
/// Ports and IPv6 brackets are stripped.
pub fn extract_network_host(action: &str) -> Option<String> {
    if let Some(target) = action.strip_prefix("CONNECT ") {
        let authority = target.split_whitespace().next()?;
        return Some(strip_port(authority));
    }

    // "GET https://host/path" style: the URL is the second token.
    let url = action.split_whitespace().nth(1)?;
    let rest = url.split_once("://").map(|(_, rest)| rest)?;
    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        return None;
    }
    Some(strip_port(authority))
}

/// Drop a `:port` suffix and IPv6 brackets from an authority string.
fn strip_port(authority: &str) -> String {
    if let Some(inner) = authority.strip_prefix('[') {
        // [::1]:443 or [::1]
        if let Some((host, _)) = inner.split_once(']') {
            return host.to_string();
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => authority.to_string(),
    }
}

fn is_ipv4_literal(host: &str) -> bool {
    let octets: Vec<&str> = host.split('.').collect();
    octets.len() == 4
        && octets
            .iter()
            .all(|o| !o.is_empty() && o.len() <= 3 && o.parse::<u8>().is_ok())
}
