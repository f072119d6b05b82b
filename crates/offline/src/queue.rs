//! Durable FIFO queue of writes waiting for the server.
//!
//! Each entry is persisted under `queue:{id}` before `enqueue` returns, so a
//! restart never loses a write the user saw accepted. Ordering is carried by a
//! monotonically increasing `seq`, restored on load.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stockcount_core::{Entity, MutationId, SessionId};
use stockcount_inventory::{CountLine, CountSession, UnknownItem};
use tokio::sync::{Mutex, MutexGuard};

use crate::storage::{KeyValueStore, StorageError};
use crate::types::SyncConflict;

const PREFIX: &str = "queue:";

/// What a queued write does on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Session,
    CloseSession,
    CountLine,
    UnknownItem,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Session => "session",
            MutationKind::CloseSession => "close_session",
            MutationKind::CountLine => "count_line",
            MutationKind::UnknownItem => "unknown_item",
        }
    }

    /// Server endpoint for this kind of write. `None` if the payload lacks the
    /// session it belongs to.
    pub fn endpoint(&self, payload: &Value) -> Option<String> {
        let session = || payload.get("session_id").and_then(Value::as_str);
        match self {
            MutationKind::Session => Some("/sessions".to_string()),
            MutationKind::CloseSession => session().map(|s| format!("/sessions/{s}/close")),
            MutationKind::CountLine => session().map(|s| format!("/sessions/{s}/lines")),
            MutationKind::UnknownItem => {
                session().map(|s| format!("/sessions/{s}/unknown-items"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Waiting for the next sync.
    Pending,
    /// Refused with a conflict; waits for a human decision.
    Conflicted,
}

/// A write recorded on the device and not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Idempotency key, minted before the first network attempt.
    pub id: MutationId,
    /// Position in the queue; assigned on enqueue.
    #[serde(default)]
    pub seq: u64,
    pub kind: MutationKind,
    /// Cache key of the entity this write targets. Writes to the same entity
    /// are replayed strictly in order.
    #[serde(default)]
    pub entity: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    pub status: MutationStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Resubmit skipping the server's conflict check.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub conflict: Option<SyncConflict>,
}

impl QueuedMutation {
    pub fn new(kind: MutationKind, entity: Option<String>, payload: Value) -> Self {
        Self {
            id: MutationId::new(),
            seq: 0,
            kind,
            entity,
            payload,
            created_at: Utc::now(),
            attempts: 0,
            status: MutationStatus::Pending,
            last_error: None,
            force: false,
            conflict: None,
        }
    }

    pub fn endpoint(&self) -> Option<String> {
        self.kind.endpoint(&self.payload)
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    /// Cache key of the record this write creates or changes.
    pub fn cache_key(&self) -> Option<String> {
        let (kind, field) = match self.kind {
            MutationKind::Session => (CountSession::KIND, "id"),
            MutationKind::CloseSession => (CountSession::KIND, "session_id"),
            MutationKind::CountLine => (CountLine::KIND, "id"),
            MutationKind::UnknownItem => (UnknownItem::KIND, "id"),
        };
        let id = self.payload.get(field).and_then(Value::as_str)?;
        Some(format!("{kind}:{id}"))
    }

    /// Cache key of the session line list a count line belongs to.
    pub fn list_key(&self) -> Option<String> {
        if self.kind != MutationKind::CountLine {
            return None;
        }
        let session_id: SessionId = self
            .payload
            .get("session_id")
            .and_then(Value::as_str)?
            .parse()
            .ok()?;
        Some(CountLine::list_key(&session_id))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    loaded: bool,
    entries: Vec<QueuedMutation>,
    next_seq: u64,
}

impl QueueState {
    fn position(&self, id: MutationId) -> Option<usize> {
        self.entries.iter().position(|m| m.id == id)
    }
}

/// Persistent, ordered queue of [`QueuedMutation`]s.
///
/// Callers only append; the reconciler removes entries after a terminal
/// outcome. Every operation holds one async lock across its storage write, so a
/// check and the write that depends on it cannot interleave with another task.
pub struct OfflineMutationQueue {
    store: Arc<dyn KeyValueStore>,
    state: Mutex<QueueState>,
}

impl OfflineMutationQueue {
    /// Create a queue over `store`; persisted entries are loaded on first use.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            state: Mutex::new(QueueState::default()),
        }
    }

    fn storage_key(id: MutationId) -> String {
        format!("{PREFIX}{id}")
    }

    async fn lock(&self) -> Result<MutexGuard<'_, QueueState>, StorageError> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            self.load(&mut state).await?;
        }
        Ok(state)
    }

    async fn load(&self, state: &mut QueueState) -> Result<(), StorageError> {
        let mut entries = Vec::new();
        for key in self.store.keys(PREFIX).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<QueuedMutation>(&raw) {
                Ok(mutation) => entries.push(mutation),
                // Left in storage so it can be inspected; never silently deleted.
                Err(err) => {
                    tracing::error!(key = %key, error = %err, "skipping unreadable queued mutation")
                }
            }
        }
        entries.sort_by_key(|m| (m.seq, m.created_at));

        if !entries.is_empty() {
            tracing::info!(pending = entries.len(), "restored offline queue");
        }
        state.next_seq = entries.last().map(|m| m.seq + 1).unwrap_or(1);
        state.entries = entries;
        state.loaded = true;
        Ok(())
    }

    async fn persist(&self, mutation: &QueuedMutation) -> Result<(), StorageError> {
        let key = Self::storage_key(mutation.id);
        let raw = serde_json::to_string(mutation).map_err(|e| StorageError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, &raw).await
    }

    /// Append a new write. Returns the stored mutation.
    pub async fn enqueue(
        &self,
        kind: MutationKind,
        entity: Option<String>,
        payload: Value,
    ) -> Result<QueuedMutation, StorageError> {
        self.push(QueuedMutation::new(kind, entity, payload)).await
    }

    /// Append a mutation whose id was minted earlier (e.g. before an online
    /// attempt that failed). Pushing an id that is already queued returns the
    /// queued copy unchanged.
    pub async fn push(&self, mut mutation: QueuedMutation) -> Result<QueuedMutation, StorageError> {
        let mut state = self.lock().await?;
        if let Some(pos) = state.position(mutation.id) {
            return Ok(state.entries[pos].clone());
        }

        mutation.seq = state.next_seq;
        self.persist(&mutation).await?;

        state.next_seq += 1;
        state.entries.push(mutation.clone());
        tracing::info!(
            mutation_id = %mutation.id,
            kind = mutation.kind.as_str(),
            queued = state.entries.len(),
            "queued offline mutation"
        );
        Ok(mutation)
    }

    /// Append `mutation` only if earlier writes to the same entity are still
    /// queued, so it cannot overtake them. Returns `None` (nothing queued) when
    /// the entity has no queued writes.
    pub async fn enqueue_behind(
        &self,
        mutation: QueuedMutation,
    ) -> Result<Option<QueuedMutation>, StorageError> {
        let Some(entity) = mutation.entity.clone() else {
            return Ok(None);
        };
        let mut state = self.lock().await?;
        if !state
            .entries
            .iter()
            .any(|m| m.entity.as_ref() == Some(&entity))
        {
            return Ok(None);
        }

        let mut mutation = mutation;
        mutation.seq = state.next_seq;
        self.persist(&mutation).await?;
        state.next_seq += 1;
        state.entries.push(mutation.clone());
        tracing::info!(
            mutation_id = %mutation.id,
            entity = %entity,
            "queued behind earlier writes to the same entity"
        );
        Ok(Some(mutation))
    }

    /// Snapshot of every queued mutation in FIFO order (conflicted included).
    /// Nothing is removed.
    pub async fn dequeue_all(&self) -> Result<Vec<QueuedMutation>, StorageError> {
        Ok(self.lock().await?.entries.clone())
    }

    /// Mutations waiting for the next sync, in FIFO order.
    pub async fn pending(&self) -> Result<Vec<QueuedMutation>, StorageError> {
        let state = self.lock().await?;
        Ok(state.entries.iter().filter(|m| m.is_pending()).cloned().collect())
    }

    /// Mutations parked on an unresolved conflict.
    pub async fn conflicts(&self) -> Result<Vec<QueuedMutation>, StorageError> {
        let state = self.lock().await?;
        Ok(state.entries.iter().filter(|m| !m.is_pending()).cloned().collect())
    }

    pub async fn get(&self, id: MutationId) -> Result<Option<QueuedMutation>, StorageError> {
        let state = self.lock().await?;
        Ok(state.position(id).map(|pos| state.entries[pos].clone()))
    }

    /// Whether a write of `kind` for `entity` is still queued.
    pub async fn contains(&self, entity: &str, kind: MutationKind) -> Result<bool, StorageError> {
        let state = self.lock().await?;
        Ok(state
            .entries
            .iter()
            .any(|m| m.kind == kind && m.entity.as_deref() == Some(entity)))
    }

    pub async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.lock().await?.entries.len())
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }

    /// Remove a mutation after a terminal outcome.
    pub async fn remove(&self, id: MutationId) -> Result<Option<QueuedMutation>, StorageError> {
        let mut state = self.lock().await?;
        let Some(pos) = state.position(id) else {
            return Ok(None);
        };
        self.store.delete(&Self::storage_key(id)).await?;
        Ok(Some(state.entries.remove(pos)))
    }

    /// Record a failed attempt; the mutation stays queued.
    pub async fn record_attempt(&self, id: MutationId, error: &str) -> Result<(), StorageError> {
        self.update(id, |m| {
            m.attempts += 1;
            m.last_error = Some(error.to_string());
        })
        .await
    }

    /// Park a mutation on a conflict until it is resolved.
    pub async fn mark_conflicted(
        &self,
        id: MutationId,
        conflict: SyncConflict,
    ) -> Result<(), StorageError> {
        self.update(id, move |m| {
            m.attempts += 1;
            m.status = MutationStatus::Conflicted;
            m.last_error = Some(conflict.reason.clone());
            m.conflict = Some(conflict);
        })
        .await
    }

    /// Put a conflicted mutation back in line, optionally with a new payload.
    /// It keeps its id and its position.
    pub async fn requeue(
        &self,
        id: MutationId,
        payload: Option<Value>,
        force: bool,
    ) -> Result<(), StorageError> {
        self.update(id, move |m| {
            if let Some(payload) = payload {
                m.payload = payload;
            }
            m.status = MutationStatus::Pending;
            m.force = force;
            m.conflict = None;
        })
        .await
    }

    async fn update(
        &self,
        id: MutationId,
        f: impl FnOnce(&mut QueuedMutation),
    ) -> Result<(), StorageError> {
        let mut state = self.lock().await?;
        let Some(pos) = state.position(id) else {
            tracing::warn!(mutation_id = %id, "update for mutation no longer queued");
            return Ok(());
        };
        let mut updated = state.entries[pos].clone();
        f(&mut updated);
        self.persist(&updated).await?;
        state.entries[pos] = updated;
        Ok(())
    }
}
