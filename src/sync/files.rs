//! Per-file export handling: approve-on-apply edits and explicit sync
//! requests.
//!
//! Filesystem permission requests carry the proposed change in their
//! metadata (`toolName`, `targetFile`, and either `writeContent` or an
//! `editContext`). Nothing touches the host when the request is filed;
//! [`FileSync::apply_filesystem_request`] runs **at approval time** and
//! validates that the edit still applies. A stale edit (file gone, or
//! `old_string` no longer present) fails, and the control plane turns
//! that failure into a denial plus a 409 for the operator.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::EXCLUDED_DIRS;
use crate::config::{CategoryMode, ConfigStore};
use crate::queue::{Category, PermissionQueue, PermissionRequest};
use crate::rules::{self, Verdict};
use serde_json::Map;

/// One workspace file eligible for syncing, as shown to the operator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFile {
    /// Workspace-relative path.
    pub path: String,
    pub size: u64,
    /// Modification time, wall-clock milliseconds.
    pub modified_at: i64,
}

/// File export mediation between the workspace and the host project.
pub struct FileSync {
    workspace: PathBuf,
    host: PathBuf,
    queue: Arc<PermissionQueue>,
    config: Arc<ConfigStore>,
}

impl FileSync {
    pub fn new(
        workspace: PathBuf,
        host: PathBuf,
        queue: Arc<PermissionQueue>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            workspace,
            host,
            queue,
            config,
        }
    }

    /// Apply an approved filesystem request to the host project.
    ///
    /// - `Write`: create directories and write `writeContent` verbatim.
    ///   Idempotent.
    /// - `Edit`: replace the first occurrence of
    ///   `editContext.old_string`; a missing file or missing needle is
    ///   stale and fails without modifying anything.
    ///
    /// Returns `Err(message)` when the request cannot be applied.
    pub fn apply_filesystem_request(&self, request: &PermissionRequest) -> Result<(), String> {
        let tool = request
            .metadata
            .get("toolName")
            .and_then(Value::as_str)
            .ok_or_else(|| "filesystem request has no toolName".to_string())?;
        let target = request
            .target_file()
            .ok_or_else(|| "filesystem request has no targetFile".to_string())?;
        let path = self.host.join(target);

        match tool {
            "Write" => {
                let content = request
                    .metadata
                    .get("writeContent")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "Write request has no writeContent".to_string())?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| format!("failed to create {:?}: {}", parent, e))?;
                }
                fs::write(&path, content)
                    .map_err(|e| format!("failed to write {:?}: {}", path, e))?;
                debug!("Applied Write to {:?}", path);
                Ok(())
            }
            "Edit" => {
                let context = request
                    .metadata
                    .get("editContext")
                    .and_then(Value::as_object)
                    .ok_or_else(|| "Edit request has no editContext".to_string())?;
                let old_string = context
                    .get("old_string")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "editContext has no old_string".to_string())?;
                let new_string = context
                    .get("new_string")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "editContext has no new_string".to_string())?;

                let current = fs::read_to_string(&path).map_err(|_| {
                    format!("file {} no longer exists; edit is stale", target)
                })?;
                if !current.contains(old_string) {
                    return Err(format!(
                        "file {} changed since the edit was proposed; edit is stale",
                        target
                    ));
                }
                let updated = current.replacen(old_string, new_string, 1);
                fs::write(&path, updated)
                    .map_err(|e| format!("failed to write {:?}: {}", path, e))?;
                debug!("Applied Edit to {:?}", path);
                Ok(())
            }
            other => Err(format!("unsupported filesystem tool: {}", other)),
        }
    }

    /// Decide and execute a sync for each requested workspace file.
    ///
    /// Per path: a deny rule refuses; an allow rule copies; `allow-all`
    /// mode copies; anything else queues a filesystem request and awaits
    /// the operator. Returns path -> whether the file was synced.
    pub async fn request_file_sync(&self, paths: Vec<String>) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for path in paths {
            let synced = self.sync_one(&path).await;
            results.insert(path, synced);
        }
        results
    }

    async fn sync_one(&self, path: &str) -> bool {
        match rules::evaluate(&self.config.rules(), Category::Filesystem, path) {
            Some(Verdict::Deny) => return false,
            Some(Verdict::Allow) => return self.copy_to_host(path),
            None => {}
        }

        if self.config.category_mode(Category::Filesystem) == CategoryMode::AllowAll {
            return self.copy_to_host(path);
        }

        let mut metadata = Map::new();
        metadata.insert("targetFile".to_string(), Value::from(path));
        let (_request, waiter) = self.queue.request(
            Category::Filesystem,
            format!("sync {}", path),
            format!("Export {} to the host project", path),
            None,
            metadata,
        );

        match waiter.await {
            Ok(true) => self.copy_to_host(path),
            _ => false,
        }
    }

    /// Copy one workspace file to the host, creating directories.
    pub fn copy_to_host(&self, relative: &str) -> bool {
        let src = self.workspace.join(relative);
        let dst = self.host.join(relative);
        if !src.exists() {
            warn!("Sync source missing: {:?}", src);
            return false;
        }
        if let Some(parent) = dst.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("Failed to create {:?}: {}", parent, e);
                return false;
            }
        }
        match fs::copy(&src, &dst) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to copy {:?} -> {:?}: {}", src, dst, e);
                false
            }
        }
    }

    /// List all non-excluded workspace files for the sync UI.
    pub fn list_files(&self) -> Vec<SyncFile> {
        let mut files = Vec::new();
        collect_files(&self.workspace, &self.workspace, &mut files);
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<SyncFile>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if EXCLUDED_DIRS.iter().any(|ex| *ex == name) {
                continue;
            }
            collect_files(root, &path, out);
        } else if let Ok(meta) = entry.metadata() {
            let relative = match path.strip_prefix(root) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            let modified_at = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            out.push(SyncFile {
                path: relative,
                size: meta.len(),
                modified_at,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::config::RuleKind;
    use crate::queue::ResolvedBy;
    use tempfile::TempDir;

    fn setup() -> (FileSync, Arc<PermissionQueue>, Arc<ConfigStore>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        let host = dir.path().join("host");
        fs::create_dir_all(&workspace).unwrap();
        fs::create_dir_all(&host).unwrap();

        let config = Arc::new(ConfigStore::new(dir.path().join("sandbox.config.json")));
        let queue = PermissionQueue::new(None, AuditLog::null());
        let sync = FileSync::new(workspace, host, queue.clone(), config.clone());
        (sync, queue, config, dir)
    }

    fn write_request(target: &str, content: &str) -> PermissionRequest {
        let mut metadata = Map::new();
        metadata.insert("toolName".to_string(), Value::from("Write"));
        metadata.insert("targetFile".to_string(), Value::from(target));
        metadata.insert("writeContent".to_string(), Value::from(content));
        PermissionRequest::new(
            "req-0".to_string(),
            Category::Filesystem,
            format!("Write {}", target),
            String::new(),
            None,
            metadata,
        )
    }

    fn edit_request(target: &str, old: &str, new: &str) -> PermissionRequest {
        let mut context = Map::new();
        context.insert("old_string".to_string(), Value::from(old));
        context.insert("new_string".to_string(), Value::from(new));
        let mut metadata = Map::new();
        metadata.insert("toolName".to_string(), Value::from("Edit"));
        metadata.insert("targetFile".to_string(), Value::from(target));
        metadata.insert("editContext".to_string(), Value::Object(context));
        PermissionRequest::new(
            "req-1".to_string(),
            Category::Filesystem,
            format!("Edit {}", target),
            String::new(),
            None,
            metadata,
        )
    }

    #[test]
    fn test_apply_write_creates_directories() {
        let (sync, _queue, _config, dir) = setup();

        let req = write_request("src/deep/foo.ts", "export const x = 1;\n");
        sync.apply_filesystem_request(&req).unwrap();

        let written = fs::read_to_string(dir.path().join("host/src/deep/foo.ts")).unwrap();
        assert_eq!(written, "export const x = 1;\n");

        // Idempotent
        sync.apply_filesystem_request(&req).unwrap();
    }

    #[test]
    fn test_apply_edit_replaces_first_occurrence() {
        let (sync, _queue, _config, dir) = setup();
        fs::write(dir.path().join("host/a.txt"), "one two one").unwrap();

        let req = edit_request("a.txt", "one", "ONE");
        sync.apply_filesystem_request(&req).unwrap();

        let content = fs::read_to_string(dir.path().join("host/a.txt")).unwrap();
        assert_eq!(content, "ONE two one");
    }

    #[test]
    fn test_apply_edit_missing_file_is_stale() {
        let (sync, _queue, _config, _dir) = setup();
        let req = edit_request("ghost.txt", "a", "b");
        let err = sync.apply_filesystem_request(&req).unwrap_err();
        assert!(err.contains("stale"));
    }

    #[test]
    fn test_apply_edit_missing_needle_is_stale() {
        let (sync, _queue, _config, dir) = setup();
        fs::write(dir.path().join("host/b.txt"), "hello world").unwrap();

        let req = edit_request("b.txt", "not present", "x");
        let err = sync.apply_filesystem_request(&req).unwrap_err();
        assert!(err.contains("stale"));
        // Untouched on failure
        assert_eq!(
            fs::read_to_string(dir.path().join("host/b.txt")).unwrap(),
            "hello world"
        );
    }

    #[test]
    fn test_apply_unknown_tool_fails() {
        let (sync, _queue, _config, _dir) = setup();
        let mut metadata = Map::new();
        metadata.insert("toolName".to_string(), Value::from("Bash"));
        metadata.insert("targetFile".to_string(), Value::from("x"));
        let req = PermissionRequest::new(
            "req-2".to_string(),
            Category::Filesystem,
            "Bash x".to_string(),
            String::new(),
            None,
            metadata,
        );
        assert!(sync.apply_filesystem_request(&req).is_err());
    }

    #[tokio::test]
    async fn test_sync_deny_rule_refuses() {
        let (sync, _queue, config, dir) = setup();
        fs::write(dir.path().join("workspace/secret.env"), "KEY=1").unwrap();
        config.add_rule(RuleKind::Deny, "filesystem(*.env)");

        let results = sync.request_file_sync(vec!["secret.env".to_string()]).await;
        assert_eq!(results["secret.env"], false);
        assert!(!dir.path().join("host/secret.env").exists());
    }

    #[tokio::test]
    async fn test_sync_allow_rule_copies() {
        let (sync, queue, config, dir) = setup();
        fs::write(dir.path().join("workspace/main.rs"), "fn main() {}").unwrap();
        config.add_rule(RuleKind::Allow, "filesystem(*.rs)");

        let results = sync.request_file_sync(vec!["main.rs".to_string()]).await;
        assert_eq!(results["main.rs"], true);
        assert!(dir.path().join("host/main.rs").exists());
        assert!(queue.pending().is_empty());
    }

    #[tokio::test]
    async fn test_sync_allow_all_mode_copies() {
        let (sync, queue, config, dir) = setup();
        fs::write(dir.path().join("workspace/note.md"), "hi").unwrap();
        config.set_category_mode(Category::Filesystem, CategoryMode::AllowAll);

        let results = sync.request_file_sync(vec!["note.md".to_string()]).await;
        assert_eq!(results["note.md"], true);
        assert!(queue.pending().is_empty());
        assert!(dir.path().join("host/note.md").exists());
    }

    #[tokio::test]
    async fn test_sync_queues_and_copies_on_approval() {
        let (sync, queue, _config, dir) = setup();
        fs::write(dir.path().join("workspace/lib.rs"), "pub fn f() {}").unwrap();

        let queue_clone = queue.clone();
        let approver = tokio::spawn(async move {
            // Wait for the request to appear, then approve it.
            for _ in 0..100 {
                if let Some(req) = queue_clone.pending().first().cloned() {
                    assert_eq!(req.action, "sync lib.rs");
                    queue_clone.approve(&req.id, ResolvedBy::Web);
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            panic!("request never appeared");
        });

        let results = sync.request_file_sync(vec!["lib.rs".to_string()]).await;
        approver.await.unwrap();

        assert_eq!(results["lib.rs"], true);
        assert!(dir.path().join("host/lib.rs").exists());
    }

    #[tokio::test]
    async fn test_sync_queued_denial_refuses() {
        let (sync, queue, _config, dir) = setup();
        fs::write(dir.path().join("workspace/lib.rs"), "pub fn f() {}").unwrap();

        let queue_clone = queue.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                if let Some(req) = queue_clone.pending().first().cloned() {
                    queue_clone.deny(&req.id, ResolvedBy::Web);
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });

        let results = sync.request_file_sync(vec!["lib.rs".to_string()]).await;
        assert_eq!(results["lib.rs"], false);
        assert!(!dir.path().join("host/lib.rs").exists());
    }

    #[test]
    fn test_list_files_skips_excluded_dirs() {
        let (sync, _queue, _config, dir) = setup();
        let ws = dir.path().join("workspace");
        fs::create_dir_all(ws.join(".git")).unwrap();
        fs::create_dir_all(ws.join("node_modules/zod")).unwrap();
        fs::create_dir_all(ws.join("src")).unwrap();
        fs::write(ws.join(".git/HEAD"), "ref: refs/heads/main").unwrap();
        fs::write(ws.join("node_modules/zod/index.js"), "x").unwrap();
        fs::write(ws.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(ws.join("README.md"), "# hi").unwrap();

        let files = sync.list_files();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src/main.rs"]);
        assert!(files.iter().all(|f| f.size > 0));
    }
}
