//! `stockcount-sync`: runs the background sync worker until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use stockcount_offline::{AppState, OfflineConfig, SyncWorker};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockcount_observability::init();

    let config = OfflineConfig::from_env();
    let state = Arc::new(AppState::open(config).context("failed to initialize offline state")?);

    let pending = state.queue.len().await.context("failed to open offline queue")?;
    tracing::info!(pending, "offline queue loaded");

    let mut notices = state.notifications.subscribe();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => {
                    tracing::info!(level = ?notice.level, message = %notice.message, "notice")
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "notices dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let worker = SyncWorker::new(state.clone());
    let shutdown = worker.shutdown_handle();
    let handle = worker.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");

    shutdown.notify_one();
    handle.await.context("sync worker panicked")?;
    Ok(())
}
