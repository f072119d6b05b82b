//! Replays the offline queue against the server.
//!
//! One pass:
//! - submits each queued mutation in FIFO order with its stable id;
//! - 2xx removes it and merges the server's answer into the cache;
//! - 409 (or a session already known to be closed) parks it as a conflict;
//! - other 4xx removes it and reports the server message verbatim;
//! - transport/5xx leaves it queued for the next pass.
//!
//! Once a mutation for an entity stays queued, later mutations for the same
//! entity wait for the next pass so they cannot overtake it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use stockcount_core::{Entity, MutationId};
use stockcount_inventory::{CountSession, SessionStatus};
use tokio::sync::Mutex;

use crate::api::{ApiError, FailureKind, RemoteApi, SubmitRequest};
use crate::cache::LocalCache;
use crate::error::SyncError;
use crate::network::{NetworkState, NetworkStatusMonitor};
use crate::notify::{NoticeLevel, Notifier};
use crate::queue::{MutationKind, OfflineMutationQueue, QueuedMutation};
use crate::types::{ConflictResolution, DataSource, SyncConflict, SyncRejection, SyncReport};

pub struct SyncReconciler {
    api: Arc<dyn RemoteApi>,
    queue: Arc<OfflineMutationQueue>,
    cache: Arc<LocalCache>,
    monitor: Arc<dyn NetworkStatusMonitor>,
    notifier: Option<Arc<dyn Notifier>>,
    timeout: Option<Duration>,
    running: Mutex<()>,
}

enum Replay {
    Synced,
    Conflicted(SyncConflict),
    Rejected(SyncRejection),
    Pending,
}

impl SyncReconciler {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        queue: Arc<OfflineMutationQueue>,
        cache: Arc<LocalCache>,
        monitor: Arc<dyn NetworkStatusMonitor>,
    ) -> Self {
        Self {
            api,
            queue,
            cache,
            monitor,
            notifier: None,
            timeout: None,
            running: Mutex::new(()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Timeout for each replayed submission.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn notify(&self, message: &str, level: NoticeLevel) {
        if let Some(notifier) = &self.notifier {
            notifier.show(message, level);
        }
    }

    /// Drain the queue once. Requires a confirmed `ONLINE` state.
    pub async fn sync_offline_queue(&self) -> Result<SyncReport, SyncError> {
        let state = self.monitor.status().state;
        if state != NetworkState::Online {
            return Err(SyncError::NotOnline(state));
        }
        let _running = self.running.try_lock().map_err(|_| SyncError::AlreadyRunning)?;

        let queued = self.queue.dequeue_all().await?;
        tracing::info!(queued = queued.len(), "starting offline queue sync");

        let mut report = SyncReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for mutation in queued {
            if !mutation.is_pending() {
                // Unresolved conflict: holds back its entity.
                block(&mut blocked, &mutation);
                continue;
            }
            if mutation
                .entity
                .as_ref()
                .is_some_and(|entity| blocked.contains(entity))
            {
                tracing::debug!(mutation_id = %mutation.id, "deferred behind earlier mutation");
                report.deferred.push(mutation.id);
                continue;
            }

            match self.replay(&mutation).await? {
                Replay::Synced => report.succeeded.push(mutation.id),
                Replay::Conflicted(conflict) => {
                    block(&mut blocked, &mutation);
                    report.conflicted.push(conflict);
                }
                Replay::Rejected(rejection) => {
                    self.notify(&rejection.message, NoticeLevel::Error);
                    report.failed.push(rejection);
                }
                Replay::Pending => {
                    block(&mut blocked, &mutation);
                    report.deferred.push(mutation.id);
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded.len(),
            conflicted = report.conflicted.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            "offline queue sync finished"
        );
        if !report.is_empty() {
            let level = if !report.failed.is_empty() {
                NoticeLevel::Error
            } else if !report.conflicted.is_empty() || !report.deferred.is_empty() {
                NoticeLevel::Warning
            } else {
                NoticeLevel::Success
            };
            self.notify(&report.summary(), level);
        }
        Ok(report)
    }

    async fn replay(&self, mutation: &QueuedMutation) -> Result<Replay, SyncError> {
        if let Some(conflict) = self.closed_session_conflict(mutation).await? {
            tracing::warn!(mutation_id = %mutation.id, "target session already closed");
            self.queue.mark_conflicted(mutation.id, conflict.clone()).await?;
            return Ok(Replay::Conflicted(conflict));
        }

        let Some(path) = mutation.endpoint() else {
            tracing::error!(mutation_id = %mutation.id, "queued mutation has no endpoint");
            self.queue.remove(mutation.id).await?;
            return Ok(Replay::Rejected(SyncRejection {
                mutation_id: mutation.id,
                kind: mutation.kind,
                status: 0,
                message: "mutation is missing its session reference".to_string(),
            }));
        };

        let mut request = SubmitRequest::new(path, mutation.payload.clone(), mutation.id)
            .forced(mutation.force);
        if let Some(timeout) = self.timeout {
            request = request.with_timeout(timeout);
        }

        match self.api.submit(&request).await {
            Ok(body) => {
                self.queue.remove(mutation.id).await?;
                self.cache.apply_accepted(mutation, &body).await?;
                tracing::info!(mutation_id = %mutation.id, kind = mutation.kind.as_str(), "replayed mutation");
                Ok(Replay::Synced)
            }
            Err(err) => self.classify_failure(mutation, err).await,
        }
    }

    async fn classify_failure(
        &self,
        mutation: &QueuedMutation,
        err: ApiError,
    ) -> Result<Replay, SyncError> {
        match err.kind() {
            FailureKind::Transport | FailureKind::Server => {
                tracing::warn!(mutation_id = %mutation.id, error = %err, "replay failed; keeping mutation queued");
                self.queue.record_attempt(mutation.id, &err.to_string()).await?;
                Ok(Replay::Pending)
            }
            FailureKind::Conflict => {
                let conflict = SyncConflict {
                    mutation_id: mutation.id,
                    kind: mutation.kind,
                    reason: err.message(),
                    server_state: err.body().cloned(),
                    target: mutation.cache_key(),
                    client_state: mutation.payload.clone(),
                    detected_at: Utc::now(),
                };
                tracing::warn!(mutation_id = %mutation.id, reason = %conflict.reason, "server reported conflict");
                self.queue.mark_conflicted(mutation.id, conflict.clone()).await?;
                Ok(Replay::Conflicted(conflict))
            }
            FailureKind::NotFound | FailureKind::Rejected => {
                let status = err.status_code().unwrap_or(0);
                tracing::warn!(
                    mutation_id = %mutation.id,
                    status,
                    message = %err.message(),
                    "server rejected queued mutation"
                );
                self.queue.remove(mutation.id).await?;
                if err.kind() == FailureKind::NotFound {
                    self.cache.forget_target(mutation).await?;
                } else {
                    self.cache.discard_provisional(mutation).await?;
                }
                Ok(Replay::Rejected(SyncRejection {
                    mutation_id: mutation.id,
                    kind: mutation.kind,
                    status,
                    message: err.message(),
                }))
            }
        }
    }

    /// A line for a session the server already reported closed cannot succeed.
    async fn closed_session_conflict(
        &self,
        mutation: &QueuedMutation,
    ) -> Result<Option<SyncConflict>, SyncError> {
        if !matches!(mutation.kind, MutationKind::CountLine | MutationKind::UnknownItem) {
            return Ok(None);
        }
        let Some(session_id) = mutation.payload.get("session_id").and_then(Value::as_str) else {
            return Ok(None);
        };
        let key = format!("{}:{session_id}", CountSession::KIND);
        let Some(entry) = self.cache.entry(&key).await? else {
            return Ok(None);
        };
        // Only the server's own view counts; a locally queued close has not
        // happened yet.
        if entry.source != DataSource::Api {
            return Ok(None);
        }
        let closed = entry
            .payload
            .get("status")
            .and_then(|s| serde_json::from_value::<SessionStatus>(s.clone()).ok())
            == Some(SessionStatus::Closed);
        if !closed {
            return Ok(None);
        }

        Ok(Some(SyncConflict {
            mutation_id: mutation.id,
            kind: mutation.kind,
            reason: "Session closed".to_string(),
            server_state: Some(entry.payload),
            target: Some(key),
            client_state: mutation.payload.clone(),
            detected_at: Utc::now(),
        }))
    }

    /// Apply a human decision to a parked conflict.
    pub async fn resolve_conflict(
        &self,
        id: MutationId,
        resolution: ConflictResolution,
    ) -> Result<(), SyncError> {
        let mutation = self
            .queue
            .get(id)
            .await?
            .ok_or(SyncError::UnknownMutation(id))?;
        let Some(conflict) = mutation.conflict.clone() else {
            return Err(SyncError::NoConflict(id));
        };

        match resolution {
            ConflictResolution::AcceptServer => {
                self.queue.remove(id).await?;
                let adopted = match (&conflict.target, &conflict.server_state) {
                    (Some(target), Some(state)) => {
                        let entry = self
                            .cache
                            .merge(target, &server_fields(state), DataSource::Api)
                            .await?;
                        Some((target, entry))
                    }
                    _ => None,
                };
                match adopted {
                    // The server's version replaces this write's own record.
                    Some((target, entry)) if mutation.cache_key().as_ref() == Some(target) => {
                        if let Some(list_key) = mutation.list_key() {
                            self.cache
                                .upsert_in_list(&list_key, &entry.payload, DataSource::Api)
                                .await?;
                        }
                    }
                    _ => self.cache.discard_provisional(&mutation).await?,
                }
                tracing::info!(mutation_id = %id, "conflict resolved: server state kept");
            }
            ConflictResolution::AcceptClient => {
                self.queue.requeue(id, None, true).await?;
                tracing::info!(mutation_id = %id, "conflict resolved: client resubmits");
            }
            ConflictResolution::Merge(payload) => {
                self.queue.requeue(id, Some(payload), true).await?;
                tracing::info!(mutation_id = %id, "conflict resolved: merged payload resubmits");
            }
        }
        Ok(())
    }
}

/// Server state without the human-readable error fields of a 409 body.
fn server_fields(state: &Value) -> Value {
    let mut fields = state.clone();
    if let Value::Object(map) = &mut fields {
        map.remove("detail");
        map.remove("message");
    }
    fields
}

fn block(blocked: &mut HashSet<String>, mutation: &QueuedMutation) {
    if let Some(entity) = &mutation.entity {
        blocked.insert(entity.clone());
    }
}
