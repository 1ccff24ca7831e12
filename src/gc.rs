//! Garbage collection of idle sessions and expired workspaces
//!
//! A periodic task that (a) reaps stateful sessions idle past their
//! timeout, and (b) unlinks workspace directories older than the
//! file-expiry window that no live session owns. Workspaces of acquired
//! sessions are never deleted.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::session::SessionRegistry;
use crate::workspace::WorkspaceManager;

/// One GC pass: reap idle sessions, then sweep expired workspaces.
pub async fn sweep(
    registry: &Arc<SessionRegistry>,
    workspaces: &WorkspaceManager,
    file_expiry: Duration,
) {
    let reaped = registry.reap().await;
    if !reaped.is_empty() {
        tracing::info!(count = reaped.len(), "reaped idle sessions");
    }

    let live = registry.live_workspace_ids().await;
    for id in workspaces.scan_expired(file_expiry) {
        if live.contains(&id) {
            continue;
        }
        if let Err(e) = workspaces.remove(id).await {
            tracing::warn!(workspace = %id, "failed to remove expired workspace: {e}");
        }
    }
}

/// Run the GC on `interval` until `shutdown` fires.
pub async fn run_loop(
    registry: Arc<SessionRegistry>,
    workspaces: WorkspaceManager,
    interval: Duration,
    file_expiry: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so a fresh bridge does not
    // sweep before serving anything.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("gc loop stopped");
                break;
            }
            _ = ticker.tick() => {
                sweep(&registry, &workspaces, file_expiry).await;
            }
        }
    }
}
