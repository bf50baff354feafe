//! Workspace synchronization: the live workspace-to-host mirror,
//! approve-on-apply file edits, per-file sync requests, and git sync
//! from the staging repo to the real remote.

pub mod files;
pub mod git;
pub mod mirror;

use std::path::PathBuf;

use thiserror::Error;

pub use files::{FileSync, SyncFile};
pub use git::{GitSync, GitSyncInfo};
pub use mirror::{full_sync, LiveMirror};

/// Directories never mirrored or listed.
pub const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules"];

/// Errors from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("rsync failed: {0}")]
    Rsync(String),

    #[error("git command failed: {0}")]
    Git(String),
}
