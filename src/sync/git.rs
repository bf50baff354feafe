//! Git sync from the staging repo to the real remote.
//!
//! The agent pushes freely to a bare staging repository inside the
//! sandbox boundary. Nothing reaches the real remote until a push is
//! approved here. Branch listing computes an ahead/behind diffstat
//! against `real-remote/<branch>`; branches the remote has never seen
//! are surfaced as new.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Map;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::SyncError;
use crate::config::{CategoryMode, ConfigStore};
use crate::queue::{Category, PermissionQueue};
use crate::rules::{self, Verdict};

/// Name of the real remote configured in the staging repo.
const REAL_REMOTE: &str = "real-remote";

/// Diffstat for one staging branch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSyncInfo {
    pub branch: String,
    pub ahead: u64,
    pub behind: u64,
    pub new_branch: bool,
}

/// Staging-to-remote git mediation.
pub struct GitSync {
    queue: Arc<PermissionQueue>,
    config: Arc<ConfigStore>,
}

impl GitSync {
    pub fn new(queue: Arc<PermissionQueue>, config: Arc<ConfigStore>) -> Self {
        Self { queue, config }
    }

    fn staging_repo(&self) -> PathBuf {
        PathBuf::from(self.config.get().git_staging_repo)
    }

    async fn git(&self, args: &[&str]) -> Result<String, SyncError> {
        let repo = self.staging_repo();
        let output = Command::new("git")
            .arg("-C")
            .arg(&repo)
            .args(args)
            .output()
            .await
            .map_err(|e| SyncError::Git(format!("failed to spawn git: {}", e)))?;
        if !output.status.success() {
            return Err(SyncError::Git(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Enumerate staging branches with their diffstat vs the real remote.
    pub async fn list_branches(&self) -> Result<Vec<GitSyncInfo>, SyncError> {
        // Refresh remote-tracking refs so the diffstat is current; a
        // fetch failure (offline, remote missing) degrades to stale
        // counts rather than an error.
        if let Err(e) = self.git(&["fetch", REAL_REMOTE, "--prune"]).await {
            debug!("fetch {} failed: {}", REAL_REMOTE, e);
        }

        let refs = self
            .git(&["for-each-ref", "refs/heads", "--format=%(refname:short)"])
            .await?;

        let mut branches = Vec::new();
        for branch in refs.lines().filter(|l| !l.is_empty()) {
            let range = format!("{}...{}/{}", branch, REAL_REMOTE, branch);
            match self
                .git(&["rev-list", "--left-right", "--count", &range])
                .await
            {
                Ok(counts) => {
                    let mut parts = counts.split_whitespace();
                    let ahead = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
                    let behind = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
                    branches.push(GitSyncInfo {
                        branch: branch.to_string(),
                        ahead,
                        behind,
                        new_branch: false,
                    });
                }
                // No counterpart on the remote yet.
                Err(_) => branches.push(GitSyncInfo {
                    branch: branch.to_string(),
                    ahead: 0,
                    behind: 0,
                    new_branch: true,
                }),
            }
        }
        Ok(branches)
    }

    /// Request that a staging branch be pushed to the real remote.
    ///
    /// Pipeline: deny rule -> refused; allow rule -> push; otherwise the
    /// git category mode decides, queueing an approval for
    /// `approve-each`. Returns whether the push happened.
    pub async fn request_git_sync(&self, branch: &str) -> Result<bool, SyncError> {
        match rules::evaluate(&self.config.rules(), Category::Git, branch) {
            Some(Verdict::Deny) => {
                info!("Git sync of {} denied by rule", branch);
                return Ok(false);
            }
            Some(Verdict::Allow) => return self.push(branch).await.map(|_| true),
            None => {}
        }

        match self.config.category_mode(Category::Git) {
            CategoryMode::AllowAll | CategoryMode::ApproveBulk => {
                self.push(branch).await.map(|_| true)
            }
            CategoryMode::DenyAll => Ok(false),
            CategoryMode::ApproveEach => {
                let (_request, waiter) = self.queue.request(
                    Category::Git,
                    format!("push {}", branch),
                    format!("Push branch {} to the real remote", branch),
                    None,
                    Map::new(),
                );
                match waiter.await {
                    Ok(true) => self.push(branch).await.map(|_| true),
                    _ => Ok(false),
                }
            }
        }
    }

    async fn push(&self, branch: &str) -> Result<(), SyncError> {
        info!("Pushing {} to {}", branch, REAL_REMOTE);
        match self.git(&["push", REAL_REMOTE, branch]).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Push of {} failed: {}", branch, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::config::RuleKind;
    use crate::queue::ResolvedBy;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git_available() -> bool {
        StdCommand::new("git").arg("--version").output().is_ok()
    }

    fn sh(dir: &std::path::Path, script: &str) {
        let status = StdCommand::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "setup command failed: {}", script);
    }

    /// Staging bare repo with one committed branch and a configured (but
    /// not yet pushed-to) real remote.
    fn setup_repos(dir: &TempDir) -> (Arc<PermissionQueue>, Arc<ConfigStore>, GitSync) {
        let root = dir.path();
        sh(root, "git init --bare --initial-branch=main staging.git");
        sh(root, "git init --bare --initial-branch=main remote.git");
        sh(
            root,
            "git -C staging.git remote add real-remote ../remote.git",
        );
        sh(
            root,
            "git clone -q staging.git work \
             && cd work \
             && git config user.email t@t \
             && git config user.name t \
             && echo hello > a.txt \
             && git add a.txt \
             && git commit -qm init \
             && git push -q origin main",
        );

        let config = Arc::new(ConfigStore::new(root.join("sandbox.config.json")));
        config
            .apply_config_change(
                "gitStagingRepo",
                serde_json::Value::from(root.join("staging.git").to_string_lossy().into_owned()),
            )
            .unwrap();
        let queue = PermissionQueue::new(None, AuditLog::null());
        let sync = GitSync::new(queue.clone(), config.clone());
        (queue, config, sync)
    }

    #[tokio::test]
    async fn test_new_branch_is_flagged() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (_queue, _config, sync) = setup_repos(&dir);

        let branches = sync.list_branches().await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].branch, "main");
        assert!(branches[0].new_branch);
    }

    #[tokio::test]
    async fn test_allow_rule_pushes_immediately() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (queue, config, sync) = setup_repos(&dir);
        config.add_rule(RuleKind::Allow, "git(main)");

        assert!(sync.request_git_sync("main").await.unwrap());
        assert!(queue.pending().is_empty());

        // The remote now has the branch, so it is no longer new.
        let branches = sync.list_branches().await.unwrap();
        assert!(!branches[0].new_branch);
        assert_eq!(branches[0].ahead, 0);
    }

    #[tokio::test]
    async fn test_deny_rule_refuses() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (_queue, config, sync) = setup_repos(&dir);
        config.add_rule(RuleKind::Deny, "git(*)");

        assert!(!sync.request_git_sync("main").await.unwrap());
        let branches = sync.list_branches().await.unwrap();
        assert!(branches[0].new_branch);
    }

    #[tokio::test]
    async fn test_queued_push_waits_for_approval() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (queue, _config, sync) = setup_repos(&dir);

        let queue_clone = queue.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                if let Some(req) = queue_clone.pending().first().cloned() {
                    assert_eq!(req.action, "push main");
                    assert_eq!(req.category, Category::Git);
                    queue_clone.approve(&req.id, ResolvedBy::Web);
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });

        assert!(sync.request_git_sync("main").await.unwrap());
        let branches = sync.list_branches().await.unwrap();
        assert!(!branches[0].new_branch);
    }

    #[tokio::test]
    async fn test_deny_all_mode_refuses_without_queueing() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (queue, config, sync) = setup_repos(&dir);
        config.set_category_mode(Category::Git, CategoryMode::DenyAll);

        assert!(!sync.request_git_sync("main").await.unwrap());
        assert!(queue.pending().is_empty());
    }
}
