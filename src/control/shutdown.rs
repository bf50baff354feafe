//! Graceful shutdown sequence.
//!
//! Triggered by SIGTERM, SIGINT, or the max-uptime timer. The sequence
//! is strictly ordered so that no agent waiter survives a clean exit:
//!
//! 1. Stop the live mirror (watcher/poll loop).
//! 2. Await one final full sync and log the entry count.
//! 3. Deny every pending request as `auto`; waiters all receive false.
//! 4. Broadcast the shutdown event to connected clients.
//! 5. Flush the queue and exit the process.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::state::{AppState, ServerEvent};
use crate::queue::ResolvedBy;
use crate::sync::full_sync;

/// Run shutdown steps 1-4 plus the final queue flush. Factored out of
/// [`graceful_shutdown`] so the sequence itself is testable in-process.
pub async fn run_shutdown_sequence(state: &AppState, reason: &str) {
    info!("Graceful shutdown: {}", reason);

    state.mirror.stop();

    match full_sync(&state.workspace, &state.host_project).await {
        Ok(count) => info!("Final full sync copied {} entries", count),
        Err(e) => warn!("Final full sync failed: {}", e),
    }

    let pending = state.queue.pending();
    if !pending.is_empty() {
        info!("Denying {} pending requests on shutdown", pending.len());
        for request in pending {
            state.queue.deny(&request.id, ResolvedBy::Auto);
        }
    }

    let _ = state.events.send(ServerEvent::Shutdown {
        reason: reason.to_string(),
    });

    // Give the WebSocket writers a beat to flush the shutdown frame and
    // the audit appends to land.
    tokio::time::sleep(Duration::from_millis(200)).await;

    state.queue.flush();
    let _ = state.shutdown_tx.send(true);
}

pub async fn graceful_shutdown(state: Arc<AppState>, reason: &str) {
    run_shutdown_sequence(&state, reason).await;
    info!("Shutdown complete");
    std::process::exit(0);
}

/// Wait for SIGTERM or SIGINT, then run the shutdown sequence.
pub async fn signal_handler(state: Arc<AppState>) {
    let reason;
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => reason = "SIGTERM",
            _ = tokio::signal::ctrl_c() => reason = "SIGINT",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        reason = "interrupt";
    }

    graceful_shutdown(state, reason).await;
}
