//! Background worker that probes the server and drains the offline queue.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::network::{NetworkState, NetworkStatusMonitor};
use crate::state::AppState;
use crate::types::SyncReport;

/// Periodic sync driver.
///
/// Every `sync_interval` it probes reachability, feeds the result into the
/// network monitor and, once `ONLINE`, replays the queue. A transition to
/// `ONLINE` reported by the monitor triggers a pass immediately.
pub struct SyncWorker {
    state: Arc<AppState>,
    shutdown: Arc<Notify>,
}

impl SyncWorker {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to stop the worker (`notify_one`).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Probe once and sync if the server is confirmed reachable.
    pub async fn run_once(state: &AppState) -> Option<SyncReport> {
        let reachable = state.probe.is_reachable().await;
        state.monitor.set_reachable(reachable);
        Self::sync_if_online(state).await
    }

    async fn sync_if_online(state: &AppState) -> Option<SyncReport> {
        let network = state.monitor.status().state;
        if network != NetworkState::Online {
            tracing::debug!(?network, "skipping sync");
            return None;
        }
        match state.queue.is_empty().await {
            Ok(true) => return None,
            Ok(false) => {}
            Err(err) => {
                tracing::error!(error = %err, "failed to read offline queue");
                return None;
            }
        }

        match state.reconciler.sync_offline_queue().await {
            Ok(report) => Some(report),
            Err(SyncError::AlreadyRunning) => {
                tracing::debug!("sync already in progress");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "background sync failed");
                None
            }
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        let SyncWorker { state, shutdown } = self;

        tokio::spawn(async move {
            tracing::info!(interval = ?state.config.sync_interval, "background sync worker started");

            let mut interval = tokio::time::interval(state.config.sync_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut status = state.monitor.subscribe();

            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("background sync worker received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        Self::run_once(&state).await;
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now = status.borrow_and_update().state;
                        if now == NetworkState::Online {
                            tracing::info!("connection restored; syncing");
                            Self::sync_if_online(&state).await;
                        }
                    }
                }
            }

            tracing::info!("background sync worker stopped");
        })
    }
}
