//! Operations the counting screens call.
//!
//! Reads always resolve with data and freshness metadata, or fail with
//! [`OfflineError::NotAvailableOffline`] when nothing was ever cached. Writes
//! either reach the server, or are queued and resolve with `_offline: true`;
//! a server rejection is returned as an error and never queued.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use stockcount_core::{CountLineId, DomainError, Entity, SessionId};
use stockcount_inventory::{
    CloseSession, CountLine, CountSession, Item, NewCountLine, NewSession, NewUnknownItem,
    SessionStatus,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::api::{ApiError, FailureKind, RemoteApi, SubmitRequest};
use crate::cache::LocalCache;
use crate::error::OfflineError;
use crate::queue::{MutationKind, OfflineMutationQueue, QueuedMutation};
use crate::recovery::{RecoveryOptions, RecoveryOrchestrator, RecoveryStats};
use crate::retry::RetryOptions;
use crate::storage::StorageError;
use crate::types::{DataSource, Served};

pub struct CountingService {
    api: Arc<dyn RemoteApi>,
    cache: Arc<LocalCache>,
    queue: Arc<OfflineMutationQueue>,
    recovery: Arc<RecoveryOrchestrator>,
    retry: RetryOptions,
    gates: EntityGates,
}

impl CountingService {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        cache: Arc<LocalCache>,
        queue: Arc<OfflineMutationQueue>,
        recovery: Arc<RecoveryOrchestrator>,
        retry: RetryOptions,
    ) -> Self {
        Self {
            api,
            cache,
            queue,
            recovery,
            retry,
            gates: EntityGates::default(),
        }
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery.stats()
    }

    /// Writes waiting for the next sync (for the UI badge).
    pub async fn pending_count(&self) -> Result<usize, OfflineError> {
        Ok(self.queue.len().await?)
    }

    pub async fn get_item(&self, item_code: &str) -> Result<Served<Item>, OfflineError> {
        let code = Item::normalize_code(item_code);
        if code.is_empty() {
            return Err(DomainError::validation("item_code cannot be empty").into());
        }
        self.read(&Item::key_for(&code), &format!("/items/{code}"), "get item")
            .await
    }

    pub async fn get_session(&self, id: SessionId) -> Result<Served<CountSession>, OfflineError> {
        self.read(
            &CountSession::key_for(&id),
            &format!("/sessions/{id}"),
            "get session",
        )
        .await
    }

    pub async fn list_count_lines(
        &self,
        session_id: SessionId,
    ) -> Result<Served<Vec<CountLine>>, OfflineError> {
        self.read(
            &CountLine::list_key(&session_id),
            &format!("/sessions/{session_id}/lines"),
            "list count lines",
        )
        .await
    }

    pub async fn create_session(&self, input: NewSession) -> Result<Served<Value>, OfflineError> {
        input.validate()?;
        let session = input.into_session(SessionId::new(), Utc::now());
        let entity = session.cache_key();
        self.write(MutationKind::Session, entity, to_payload(&session)?, "create session")
            .await
    }

    pub async fn create_count_line(
        &self,
        input: NewCountLine,
    ) -> Result<Served<Value>, OfflineError> {
        input.validate()?;
        self.ensure_session_open(input.session_id).await?;
        let line = input.into_line(CountLineId::new(), Utc::now());
        let entity = CountSession::key_for(&line.session_id);
        self.write(MutationKind::CountLine, entity, to_payload(&line)?, "create count line")
            .await
    }

    pub async fn report_unknown_item(
        &self,
        input: NewUnknownItem,
    ) -> Result<Served<Value>, OfflineError> {
        input.validate()?;
        self.ensure_session_open(input.session_id).await?;
        let item = input.into_unknown_item(CountLineId::new(), Utc::now());
        let entity = CountSession::key_for(&item.session_id);
        self.write(MutationKind::UnknownItem, entity, to_payload(&item)?, "report unknown item")
            .await
    }

    pub async fn close_session(&self, input: CloseSession) -> Result<Served<Value>, OfflineError> {
        self.ensure_session_open(input.session_id).await?;
        let entity = CountSession::key_for(&input.session_id);
        let payload = json!({
            "session_id": input.session_id,
            "closed_at": Utc::now(),
        });
        self.write(MutationKind::CloseSession, entity, payload, "close session")
            .await
    }

    /// Refuse writes for a session we already know is closed, whether the
    /// cache says so or a close is still waiting in the queue.
    async fn ensure_session_open(&self, id: SessionId) -> Result<(), OfflineError> {
        let key = CountSession::key_for(&id);
        if let Some(entry) = self.cache.entry(&key).await? {
            match serde_json::from_value::<CountSession>(entry.payload.clone()) {
                Ok(session) => session.ensure_open()?,
                // A partial record still carries the status we last saw.
                Err(_) => {
                    let status = entry
                        .payload
                        .get("status")
                        .and_then(|status| serde_json::from_value::<SessionStatus>(status.clone()).ok());
                    if status == Some(SessionStatus::Closed) {
                        return Err(closed(id));
                    }
                }
            }
        }

        if self.queue.contains(&key, MutationKind::CloseSession).await? {
            return Err(closed(id));
        }
        Ok(())
    }

    async fn read<T>(&self, key: &str, path: &str, context: &str) -> Result<Served<T>, OfflineError>
    where
        T: DeserializeOwned + Send,
    {
        let api = self.api.as_ref();
        let cache = self.cache.as_ref();

        let options = RecoveryOptions::from_retry(self.retry)
            .with_cache_fallback(self.from_cache::<T>(key))
            .with_context(context);

        let outcome = self
            .recovery
            .auto_recover(
                move || async move {
                    let value = match api.get(path).await {
                        Ok(value) => value,
                        Err(err) if err.kind() == FailureKind::NotFound => {
                            return not_found(cache, key, err).await;
                        }
                        Err(err) => return Err(err.into()),
                    };
                    let data: T = serde_json::from_value(value.clone())
                        .map_err(|e| OfflineError::from(ApiError::Decode(e.to_string())))?;
                    let entry = cache.put(key, &value).await?;
                    Ok(Served {
                        cached_at: Some(entry.cached_at),
                        ..Served::fresh(data)
                    })
                },
                options,
            )
            .await;

        let used_fallback = outcome.used_fallback;
        let network_skipped = outcome.network_skipped;
        let mut served = outcome.into_result()?;
        if used_fallback {
            served.offline = network_skipped;
            served.degraded = !network_skipped;
        }
        Ok(served)
    }

    async fn from_cache<T: DeserializeOwned>(&self, key: &str) -> Result<Served<T>, OfflineError> {
        let hit = match self.cache.get::<T>(key).await {
            Ok(hit) => hit,
            // A partial record cannot stand in for the real one.
            Err(StorageError::Corrupt { reason, .. }) => {
                tracing::warn!(key, %reason, "cached copy unusable");
                None
            }
            Err(err) => return Err(err.into()),
        };
        let hit = hit.ok_or_else(|| OfflineError::NotAvailableOffline {
            key: key.to_string(),
        })?;
        Ok(Served {
            data: hit.entry.payload,
            source: cache_source(hit.entry.source),
            stale: hit.stale,
            offline: false,
            degraded: false,
            cached_at: Some(hit.entry.cached_at),
        })
    }

    async fn write(
        &self,
        kind: MutationKind,
        entity: String,
        payload: Value,
        context: &str,
    ) -> Result<Served<Value>, OfflineError> {
        // The idempotency key exists before the first network attempt.
        let mutation = QueuedMutation::new(kind, Some(entity.clone()), payload);

        // An earlier write to this entity may still be retrying; wait for it
        // to land on the server or in the queue.
        let _turn = self.gates.enter(&entity).await;

        if let Some(queued) = self.queue.enqueue_behind(mutation.clone()).await? {
            self.cache.apply_provisional(&queued).await?;
            return Ok(Served::queued(queued.payload));
        }

        let path = mutation
            .endpoint()
            .ok_or_else(|| DomainError::validation("write is missing its session reference"))?;
        let request = SubmitRequest::new(path, mutation.payload.clone(), mutation.id);
        let api = self.api.as_ref();
        let request = &request;

        let options = RecoveryOptions::from_retry(self.retry)
            .with_fallback(self.queue_locally(mutation.clone()))
            .with_context(context);

        let outcome = self
            .recovery
            .auto_recover(
                move || async move {
                    let body = api.submit(request).await?;
                    Ok::<_, OfflineError>(Served::fresh(body))
                },
                options,
            )
            .await;

        let queued = outcome.used_fallback;
        let served = outcome.into_result()?;
        if queued {
            return Ok(served);
        }

        match self.cache.apply_accepted(&mutation, &served.data).await? {
            Some(entry) => Ok(Served {
                data: entry.payload,
                cached_at: Some(entry.cached_at),
                ..Served::fresh(Value::Null)
            }),
            None => Ok(served),
        }
    }

    async fn queue_locally(&self, mutation: QueuedMutation) -> Result<Served<Value>, OfflineError> {
        let queued = self.queue.push(mutation).await?;
        self.cache.apply_provisional(&queued).await?;
        Ok(Served::queued(queued.payload))
    }
}

/// Writes to one entity run one at a time, in the order they were issued.
#[derive(Default)]
struct EntityGates {
    gates: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EntityGates {
    async fn enter(&self, entity: &str) -> Turn<'_> {
        let gate = self
            .gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(entity.to_string())
            .or_default()
            .clone();
        Turn {
            gates: self,
            entity: entity.to_string(),
            guard: Some(gate.lock_owned().await),
        }
    }
}

struct Turn<'a> {
    gates: &'a EntityGates,
    entity: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut gates = self.gates.gates.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map still holds the gate: nobody is waiting on it.
        if gates
            .get(&self.entity)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(&self.entity);
        }
    }
}

/// A 404 for something only this device knows about (queued, not yet synced)
/// serves the local copy; otherwise the cached copy is dropped.
async fn not_found<T: DeserializeOwned>(
    cache: &LocalCache,
    key: &str,
    err: ApiError,
) -> Result<Served<T>, OfflineError> {
    if let Some(entry) = cache.entry(key).await? {
        if entry.source == DataSource::Local {
            if let Ok(data) = serde_json::from_value::<T>(entry.payload) {
                return Ok(Served {
                    cached_at: Some(entry.cached_at),
                    offline: true,
                    ..Served::queued(data)
                });
            }
        }
    }
    cache.invalidate(key).await?;
    Err(err.into())
}

fn closed(id: SessionId) -> OfflineError {
    DomainError::invalid_state(format!("session {id} is closed")).into()
}

fn cache_source(source: DataSource) -> DataSource {
    match source {
        DataSource::Local => DataSource::Local,
        DataSource::Api | DataSource::Cache => DataSource::Cache,
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, OfflineError> {
    serde_json::to_value(value)
        .map_err(|e| DomainError::validation(format!("unserializable input: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectionType, NetworkState, NetworkStatusMonitor, SignalMonitor};
    use crate::reconciler::SyncReconciler;
    use crate::storage::MemoryStore;
    use crate::test_support::ScriptedApi;
    use std::time::Duration;

    struct Harness {
        api: Arc<ScriptedApi>,
        cache: Arc<LocalCache>,
        queue: Arc<OfflineMutationQueue>,
        monitor: Arc<SignalMonitor>,
        service: CountingService,
        reconciler: SyncReconciler,
    }

    fn harness(online: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(ScriptedApi::new());
        let cache = Arc::new(LocalCache::new(store.clone(), Duration::from_secs(300)));
        let queue = Arc::new(OfflineMutationQueue::new(store));
        let monitor = Arc::new(SignalMonitor::new());
        if online {
            go_online(&monitor);
        }
        let recovery = Arc::new(RecoveryOrchestrator::new().with_monitor(monitor.clone()));
        let service = CountingService::new(
            api.clone(),
            cache.clone(),
            queue.clone(),
            recovery,
            RetryOptions::new(3, Duration::from_millis(200)),
        );
        let reconciler =
            SyncReconciler::new(api.clone(), queue.clone(), cache.clone(), monitor.clone());
        Harness {
            api,
            cache,
            queue,
            monitor,
            service,
            reconciler,
        }
    }

    fn go_online(monitor: &SignalMonitor) {
        monitor.set_link(true, ConnectionType::Wifi);
        monitor.set_reachable(true);
    }

    fn new_line(session_id: SessionId) -> NewCountLine {
        NewCountLine {
            session_id,
            item_code: "x1".to_string(),
            counted_qty: 5,
            note: None,
        }
    }

    fn lines_path(session_id: SessionId) -> String {
        format!("/sessions/{session_id}/lines")
    }

    fn go_offline(monitor: &SignalMonitor) {
        monitor.set_link(false, ConnectionType::None);
        monitor.set_reachable(false);
    }

    fn aisle_session() -> CountSession {
        NewSession {
            name: "Aisle 4".to_string(),
            location: None,
        }
        .into_session(SessionId::new(), Utc::now())
    }

    #[tokio::test]
    async fn offline_write_is_queued_then_synced() {
        let h = harness(false);
        let session_id = SessionId::new();

        let served = h.service.create_count_line(new_line(session_id)).await.unwrap();
        assert_eq!(served.source, DataSource::Local);
        assert!(served.offline);
        assert_eq!(served.data["item_code"], "X1");
        assert_eq!(h.queue.len().await.unwrap(), 1);
        assert!(h.api.submissions().is_empty());

        let queued = h.queue.dequeue_all().await.unwrap();
        go_online(&h.monitor);
        assert_eq!(h.monitor.status().state, NetworkState::Online);

        let report = h.reconciler.sync_offline_queue().await.unwrap();
        assert_eq!(report.succeeded, vec![queued[0].id]);
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn online_rejection_propagates_and_is_not_queued() {
        let h = harness(true);
        let session_id = SessionId::new();
        h.api.respond(
            &lines_path(session_id),
            Err(ApiError::status(400, json!({"detail": "Session closed"}))),
        );

        let err = h
            .service
            .create_count_line(new_line(session_id))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Session closed");
        assert!(matches!(err, OfflineError::Rejected { status: 400, .. }));
        assert!(h.queue.is_empty().await.unwrap());
        assert_eq!(h.service.recovery_stats().fallback_used, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_server_errors_fall_back_to_queue() {
        let h = harness(true);
        let session_id = SessionId::new();
        let path = lines_path(session_id);
        h.api
            .respond_times(&path, Err(ApiError::status(503, Value::Null)), 3)
            .respond(&path, Err(ApiError::Timeout(Duration::from_secs(15))));

        let served = h.service.create_count_line(new_line(session_id)).await.unwrap();
        assert!(served.offline);
        assert_eq!(h.queue.len().await.unwrap(), 1);
        assert_eq!(h.api.submissions().len(), 3);

        let stats = h.service.recovery_stats();
        assert_eq!(stats.fallback_used, 1);
        assert_eq!(stats.retry_count, 2);

        // All attempts carried the same idempotency key.
        let keys: Vec<_> = h.api.submissions().into_iter().map(|s| s.key).collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(h.queue.dequeue_all().await.unwrap()[0].id, keys[0]);
    }

    #[tokio::test]
    async fn online_write_merges_server_fields_into_cache() {
        let h = harness(true);
        let served = h
            .service
            .create_session(NewSession {
                name: "Aisle 4".to_string(),
                location: Some("WH1".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(served.source, DataSource::Api);
        assert!(!served.offline);
        assert_eq!(served.data["server_seq"], 1);

        let id: SessionId = serde_json::from_value(served.data["id"].clone()).unwrap();
        let cached = h.cache.get::<CountSession>(&CountSession::key_for(&id)).await.unwrap().unwrap();
        assert_eq!(cached.entry.payload.name, "Aisle 4");
        assert_eq!(cached.entry.source, DataSource::Api);
    }

    #[tokio::test]
    async fn writes_stay_behind_queued_writes_for_the_same_session() {
        let h = harness(false);
        let served = h
            .service
            .create_session(NewSession {
                name: "Aisle 4".to_string(),
                location: None,
            })
            .await
            .unwrap();
        let session_id: SessionId = serde_json::from_value(served.data["id"].clone()).unwrap();

        go_online(&h.monitor);
        let line = h.service.create_count_line(new_line(session_id)).await.unwrap();
        assert!(line.offline);
        assert!(h.api.submissions().is_empty());

        let kinds: Vec<_> = h
            .queue
            .dequeue_all()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(kinds, vec![MutationKind::Session, MutationKind::CountLine]);

        let report = h.reconciler.sync_offline_queue().await.unwrap();
        assert_eq!(report.succeeded.len(), 2);
        let paths: Vec<_> = h.api.submissions().into_iter().map(|s| s.path).collect();
        assert_eq!(paths, vec!["/sessions".to_string(), lines_path(session_id)]);
    }

    #[tokio::test]
    async fn closed_session_refuses_new_lines_locally() {
        let h = harness(false);
        let session_id = SessionId::new();
        let session = NewSession {
            name: "Aisle 4".to_string(),
            location: None,
        }
        .into_session(session_id, Utc::now());
        h.cache.put(&session.cache_key(), &session).await.unwrap();

        h.service
            .close_session(CloseSession { session_id })
            .await
            .unwrap();
        let err = h
            .service
            .create_count_line(new_line(session_id))
            .await
            .unwrap_err();
        assert!(matches!(err, OfflineError::Validation(DomainError::InvalidState(_))));
        assert_eq!(h.queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reads_cache_online_and_serve_cache_offline() {
        let h = harness(true);
        h.api.respond(
            "/items/X1",
            Ok(json!({"item_code": "X1", "name": "Widget", "system_qty": 12})),
        );

        let fresh = h.service.get_item(" x1 ").await.unwrap();
        assert_eq!(fresh.source, DataSource::Api);
        assert_eq!(fresh.data.name, "Widget");

        h.monitor.set_link(false, ConnectionType::None);
        h.monitor.set_reachable(false);
        let cached = h.service.get_item("X1").await.unwrap();
        assert_eq!(cached.source, DataSource::Cache);
        assert!(cached.offline);
        assert!(!cached.stale);
        assert_eq!(cached.data.system_qty, Some(12));
        assert_eq!(h.api.gets().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_read_falls_back_to_cache() {
        let h = harness(true);
        h.cache
            .put("item:X1", &json!({"item_code": "X1", "name": "Widget"}))
            .await
            .unwrap();
        h.api
            .respond_times("/items/X1", Err(ApiError::Transport("connection reset".into())), 3);

        let served = h.service.get_item("X1").await.unwrap();
        assert_eq!(served.source, DataSource::Cache);
        assert!(served.degraded);
        assert!(!served.offline);
        assert_eq!(h.service.recovery_stats().cache_used, 1);
    }

    #[tokio::test]
    async fn offline_cache_miss_is_not_available_offline() {
        let h = harness(false);
        let err = h.service.get_item("NOPE").await.unwrap_err();
        assert!(matches!(err, OfflineError::NotAvailableOffline { ref key } if key == "item:NOPE"));
        assert!(err.is_user_facing());
    }

    #[tokio::test]
    async fn old_cache_entries_are_flagged_stale() {
        let h = harness(false);
        h.cache
            .put_entry(crate::cache::CacheEntry {
                key: "item:X1".to_string(),
                payload: json!({"item_code": "X1", "name": "Widget"}),
                cached_at: Utc::now() - chrono::Duration::seconds(301),
                source: DataSource::Api,
            })
            .await
            .unwrap();

        let served = h.service.get_item("X1").await.unwrap();
        assert!(served.stale);
        assert_eq!(served.source, DataSource::Cache);
    }

    #[tokio::test]
    async fn not_found_drops_cached_copy() {
        let h = harness(true);
        h.cache
            .put("item:X1", &json!({"item_code": "X1", "name": "Widget"}))
            .await
            .unwrap();

        let err = h.service.get_item("X1").await.unwrap_err();
        assert!(matches!(err, OfflineError::NotFound { .. }));
        assert!(h.cache.entry("item:X1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offline_lines_show_up_in_session_list() {
        let h = harness(false);
        let session_id = SessionId::new();
        h.service.create_count_line(new_line(session_id)).await.unwrap();
        h.service
            .create_count_line(NewCountLine {
                item_code: "y2".to_string(),
                ..new_line(session_id)
            })
            .await
            .unwrap();

        let lines = h.service.list_count_lines(session_id).await.unwrap();
        assert_eq!(lines.source, DataSource::Local);
        let codes: Vec<_> = lines.data.iter().map(|l| l.item_code.as_str()).collect();
        assert_eq!(codes, vec!["X1", "Y2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_writes_to_one_session_keep_their_order() {
        let h = harness(true);
        let session = aisle_session();
        h.api
            .respond_times("/sessions", Err(ApiError::status(503, Value::Null)), 3);

        let create = h.service.write(
            MutationKind::Session,
            session.cache_key(),
            to_payload(&session).unwrap(),
            "create session",
        );
        let line = async {
            // Issued while the session create is between retries.
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.service.create_count_line(new_line(session.id)).await
        };
        let (created, line) = tokio::join!(create, line);
        assert!(created.unwrap().offline);
        assert!(line.unwrap().offline);

        // The line never went out ahead of its session.
        let paths: Vec<_> = h.api.submissions().into_iter().map(|s| s.path).collect();
        assert_eq!(paths, vec!["/sessions"; 3]);
        let kinds: Vec<_> = h
            .queue
            .dequeue_all()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(kinds, vec![MutationKind::Session, MutationKind::CountLine]);

        let report = h.reconciler.sync_offline_queue().await.unwrap();
        assert_eq!(report.succeeded.len(), 2);
        let paths: Vec<_> = h.api.submissions().into_iter().map(|s| s.path).collect();
        assert_eq!(paths[3..], [String::from("/sessions"), lines_path(session.id)]);
    }

    #[tokio::test]
    async fn degraded_write_still_tries_the_network() {
        let h = harness(false);
        h.monitor.set_link(true, ConnectionType::Cellular);
        assert_eq!(h.monitor.status().state, NetworkState::Degraded);

        let served = h
            .service
            .create_count_line(new_line(SessionId::new()))
            .await
            .unwrap();
        assert_eq!(served.source, DataSource::Api);
        assert!(!served.offline);
        assert_eq!(h.api.submissions().len(), 1);
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn closing_an_uncached_session_records_only_the_close() {
        let h = harness(false);
        let session_id = SessionId::new();

        let served = h
            .service
            .close_session(CloseSession { session_id })
            .await
            .unwrap();
        assert!(served.offline);
        assert!(h
            .cache
            .entry(&CountSession::key_for(&session_id))
            .await
            .unwrap()
            .is_none());

        let err = h.service.get_session(session_id).await.unwrap_err();
        assert!(matches!(err, OfflineError::NotAvailableOffline { .. }));

        let err = h
            .service
            .create_count_line(new_line(session_id))
            .await
            .unwrap_err();
        assert!(matches!(err, OfflineError::Validation(DomainError::InvalidState(_))));
        assert_eq!(h.queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn partial_session_record_reads_as_miss_but_keeps_its_status() {
        let h = harness(false);
        let session_id = SessionId::new();
        h.cache
            .put(&CountSession::key_for(&session_id), &json!({"status": "closed"}))
            .await
            .unwrap();

        let err = h.service.get_session(session_id).await.unwrap_err();
        assert!(matches!(err, OfflineError::NotAvailableOffline { .. }));

        let err = h
            .service
            .create_count_line(new_line(session_id))
            .await
            .unwrap_err();
        assert!(matches!(err, OfflineError::Validation(DomainError::InvalidState(_))));
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn rejected_offline_line_leaves_the_session_list() {
        let h = harness(false);
        let session_id = SessionId::new();
        h.service.create_count_line(new_line(session_id)).await.unwrap();

        go_online(&h.monitor);
        h.api.respond(
            &lines_path(session_id),
            Err(ApiError::status(400, json!({"detail": "Session closed"}))),
        );
        let report = h.reconciler.sync_offline_queue().await.unwrap();
        assert_eq!(report.failed.len(), 1);

        go_offline(&h.monitor);
        let lines = h.service.list_count_lines(session_id).await.unwrap();
        assert!(lines.data.is_empty());
    }

    #[tokio::test]
    async fn synced_offline_line_carries_server_fields_in_session_list() {
        let h = harness(false);
        let session_id = SessionId::new();
        h.service.create_count_line(new_line(session_id)).await.unwrap();

        go_online(&h.monitor);
        let report = h.reconciler.sync_offline_queue().await.unwrap();
        assert_eq!(report.succeeded.len(), 1);

        let list = h
            .cache
            .entry(&CountLine::list_key(&session_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(list.payload.as_array().unwrap().len(), 1);
        assert_eq!(list.payload[0]["server_seq"], 1);

        go_offline(&h.monitor);
        let lines = h.service.list_count_lines(session_id).await.unwrap();
        assert_eq!(lines.data.len(), 1);
        assert_eq!(lines.data[0].item_code, "X1");
    }
}
