//! Process-wide wiring of the offline layer.

use std::sync::Arc;

use crate::api::{HttpApiClient, Reachability, RemoteApi};
use crate::cache::LocalCache;
use crate::config::OfflineConfig;
use crate::error::OfflineError;
use crate::network::SignalMonitor;
use crate::notify::NotificationHub;
use crate::queue::OfflineMutationQueue;
use crate::reconciler::SyncReconciler;
use crate::recovery::RecoveryOrchestrator;
use crate::service::CountingService;
use crate::storage::{KeyValueStore, SqliteStore};

/// One shared instance of every component. The cache and the queue are
/// singletons over the same store.
pub struct AppState {
    pub config: OfflineConfig,
    pub monitor: Arc<SignalMonitor>,
    pub probe: Arc<dyn Reachability>,
    pub cache: Arc<LocalCache>,
    pub queue: Arc<OfflineMutationQueue>,
    pub recovery: Arc<RecoveryOrchestrator>,
    pub reconciler: Arc<SyncReconciler>,
    pub service: Arc<CountingService>,
    pub notifications: NotificationHub,
}

impl AppState {
    /// SQLite store under `config.data_dir` and the HTTP client. The database
    /// is opened on first use.
    pub fn open(config: OfflineConfig) -> Result<Self, OfflineError> {
        let store = Arc::new(SqliteStore::open(config.database_path()));
        let client = Arc::new(HttpApiClient::new(&config)?);
        tracing::info!(
            api_url = %config.api_url,
            database = ?config.database_path(),
            "initializing offline state"
        );
        Ok(Self::with_parts(
            config,
            store,
            client.clone(),
            client,
            Arc::new(SignalMonitor::assume_link()),
        ))
    }

    pub fn with_parts(
        config: OfflineConfig,
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn RemoteApi>,
        probe: Arc<dyn Reachability>,
        monitor: Arc<SignalMonitor>,
    ) -> Self {
        let cache = Arc::new(LocalCache::new(store.clone(), config.stale_threshold));
        let queue = Arc::new(OfflineMutationQueue::new(store));
        let recovery = Arc::new(RecoveryOrchestrator::new().with_monitor(monitor.clone()));
        let notifications = NotificationHub::default();

        let reconciler = Arc::new(
            SyncReconciler::new(api.clone(), queue.clone(), cache.clone(), monitor.clone())
                .with_notifier(Arc::new(notifications.clone()))
                .with_timeout(config.request_timeout),
        );
        let service = Arc::new(CountingService::new(
            api,
            cache.clone(),
            queue.clone(),
            recovery.clone(),
            config.retry_options(),
        ));

        Self {
            config,
            monitor,
            probe,
            cache,
            queue,
            recovery,
            reconciler,
            service,
            notifications,
        }
    }
}
