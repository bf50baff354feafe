//! Live workspace-to-host mirror.
//!
//! On startup the mirror polls every ~2 s until the workspace looks
//! ready (a `.git/HEAD` exists), performs an initial full rsync, then
//! attaches a recursive debounced file watcher. Watcher batches flush
//! after 300 ms of quiet; each path in a batch is copied to the host if
//! it still exists, or removed from the host if it does not. `.git/` and
//! `node_modules/` never cross the boundary.
//!
//! If the watcher cannot initialize (inotify limits, cross-container
//! mounts), the mirror falls back to a periodic full rsync at the same
//! 2-second cadence: the external contract (eventually-consistent
//! mirror) is unchanged, only the latency differs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{SyncError, EXCLUDED_DIRS};

/// Cadence of the readiness poll and the rsync fallback loop.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Quiet window before a watcher batch is flushed.
const DEBOUNCE: Duration = Duration::from_millis(300);

/// The live mirror task handle.
pub struct LiveMirror {
    workspace: PathBuf,
    host: PathBuf,
    shutdown_tx: watch::Sender<bool>,
}

impl LiveMirror {
    pub fn new(workspace: PathBuf, host: PathBuf) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            workspace,
            host,
            shutdown_tx,
        })
    }

    /// Signal the mirror loop to stop. Used by graceful shutdown before
    /// the final full sync.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Spawn the mirror supervisor task.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mirror = Arc::clone(self);
        tokio::spawn(async move {
            mirror.run().await;
        })
    }

    async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Wait for the workspace to materialize.
        loop {
            if self.workspace.join(".git").join("HEAD").exists() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }

        match full_sync(&self.workspace, &self.host).await {
            Ok(count) => info!("Initial full sync copied {} entries", count),
            Err(e) => warn!("Initial full sync failed: {}", e),
        }

        // Recursive watcher with a debounce window; fall back to
        // periodic rsync if it cannot start.
        let (event_tx, event_rx) = mpsc::unbounded_channel::<PathBuf>();
        let watch_tx = event_tx.clone();
        let debouncer = new_debouncer(DEBOUNCE, move |result: DebounceEventResult| {
            if let Ok(events) = result {
                for event in events {
                    let _ = watch_tx.send(event.path);
                }
            }
        });

        let mut debouncer = match debouncer {
            Ok(d) => d,
            Err(e) => {
                warn!("File watcher unavailable ({}), using rsync polling", e);
                self.poll_loop(shutdown_rx).await;
                return;
            }
        };
        if let Err(e) = debouncer
            .watcher()
            .watch(&self.workspace, RecursiveMode::Recursive)
        {
            warn!("Failed to watch workspace ({}), using rsync polling", e);
            drop(debouncer);
            self.poll_loop(shutdown_rx).await;
            return;
        }

        info!("Live mirror watching {:?}", self.workspace);
        self.event_loop(event_rx, shutdown_rx).await;
        drop(debouncer);
    }

    async fn event_loop(
        &self,
        mut events: mpsc::UnboundedReceiver<PathBuf>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(path) => self.mirror_path(&path),
                        None => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn poll_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    if let Err(e) = full_sync(&self.workspace, &self.host).await {
                        warn!("Periodic sync failed: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Propagate one changed path: copy if it exists, remove otherwise.
    fn mirror_path(&self, path: &Path) {
        let Ok(relative) = path.strip_prefix(&self.workspace) else {
            return;
        };
        if is_excluded(relative) {
            return;
        }

        let dst = self.host.join(relative);
        if path.is_dir() {
            let _ = fs::create_dir_all(&dst);
            return;
        }
        if path.exists() {
            if let Some(parent) = dst.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    warn!("Mirror mkdir failed for {:?}: {}", parent, e);
                    return;
                }
            }
            match fs::copy(path, &dst) {
                Ok(_) => debug!("Mirrored {:?}", relative),
                Err(e) => warn!("Mirror copy failed for {:?}: {}", relative, e),
            }
        } else {
            match fs::remove_file(&dst) {
                Ok(()) => debug!("Removed {:?}", relative),
                // Already gone (or a directory): nothing to do.
                Err(_) => {}
            }
        }
    }
}

fn is_excluded(relative: &Path) -> bool {
    relative
        .components()
        .any(|c| EXCLUDED_DIRS.iter().any(|ex| c.as_os_str() == *ex))
}

/// Full rsync of the workspace onto the host directory.
///
/// `--delete` makes the host an exact mirror; the `.git` and
/// `node_modules` excludes are non-negotiable. Returns the number of
/// itemized entries rsync reported.
pub async fn full_sync(workspace: &Path, host: &Path) -> Result<usize, SyncError> {
    let src = format!("{}/", workspace.display());
    let output = Command::new("rsync")
        .arg("-a")
        .arg("--delete")
        .arg("-i")
        .arg("--exclude")
        .arg(".git")
        .arg("--exclude")
        .arg("node_modules")
        .arg(&src)
        .arg(host)
        .output()
        .await
        .map_err(|e| SyncError::Rsync(format!("failed to spawn rsync: {}", e)))?;

    if !output.status.success() {
        return Err(SyncError::Rsync(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }

    let count = output
        .stdout
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .count();
    Ok(count)
}
