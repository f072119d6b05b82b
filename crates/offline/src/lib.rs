//! `stockcount-offline`
//!
//! **Responsibility:** offline-first data access for the counting app.
//!
//! This crate provides:
//! - Tri-state network classification (`ONLINE`, `DEGRADED`, `OFFLINE`)
//! - Retry with exponential backoff, and the recovery chain built on it
//! - A persistent read-through cache with staleness metadata
//! - A durable queue of writes made offline, replayed by the reconciler
//!
//! The server stays the authority. A rejected write always reaches the user;
//! only transport failures and 5xx are absorbed.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod network;
pub mod notify;
pub mod queue;
pub mod reconciler;
pub mod recovery;
pub mod retry;
pub mod service;
pub mod state;
pub mod storage;
pub mod sync_worker;
pub mod types;

#[cfg(test)]
mod test_support;

pub use api::{ApiError, HttpApiClient, Reachability, RemoteApi, SubmitRequest};
pub use cache::{CacheEntry, CacheHit, LocalCache};
pub use config::OfflineConfig;
pub use error::{OfflineError, SyncError};
pub use network::{ConnectionType, NetworkState, NetworkStatus, NetworkStatusMonitor, SignalMonitor};
pub use notify::{Notice, NoticeLevel, NotificationHub, Notifier};
pub use queue::{MutationKind, MutationStatus, OfflineMutationQueue, QueuedMutation};
pub use reconciler::SyncReconciler;
pub use recovery::{RecoveryOptions, RecoveryOrchestrator, RecoveryOutcome, RecoveryStats};
pub use retry::{RetryOptions, Retryable, retry, retry_if};
pub use service::CountingService;
pub use state::AppState;
pub use storage::{KeyValueStore, MemoryStore, SqliteStore, StorageError};
pub use sync_worker::SyncWorker;
pub use types::{ConflictResolution, DataSource, Served, SyncConflict, SyncRejection, SyncReport};
