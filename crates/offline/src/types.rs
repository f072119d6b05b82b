//! Shared value types returned to the UI layer.
//!
//! Everything here is plain serde data so the UI can render it directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stockcount_core::MutationId;

use crate::queue::MutationKind;

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Fresh response from the server.
    Api,
    /// Previously fetched server data, served from the local cache.
    Cache,
    /// Recorded on this device and not yet confirmed by the server.
    Local,
}

/// A value handed to the UI together with its freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Served<T> {
    pub data: T,
    #[serde(rename = "_source")]
    pub source: DataSource,
    #[serde(rename = "_stale", default, skip_serializing_if = "is_false")]
    pub stale: bool,
    /// Served or queued without reaching the server.
    #[serde(rename = "_offline", default, skip_serializing_if = "is_false")]
    pub offline: bool,
    /// The network path was tried and failed; this is fallback data.
    #[serde(rename = "_degraded", default, skip_serializing_if = "is_false")]
    pub degraded: bool,
    #[serde(rename = "_cached_at", default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl<T> Served<T> {
    pub fn fresh(data: T) -> Self {
        Self {
            data,
            source: DataSource::Api,
            stale: false,
            offline: false,
            degraded: false,
            cached_at: None,
        }
    }

    pub fn queued(data: T) -> Self {
        Self {
            data,
            source: DataSource::Local,
            stale: false,
            offline: true,
            degraded: false,
            cached_at: None,
        }
    }
}

/// A queued mutation the server (or a local check) refused because the target
/// entity changed underneath it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub mutation_id: MutationId,
    pub kind: MutationKind,
    pub reason: String,
    #[serde(default)]
    pub server_state: Option<Value>,
    /// Cache key `server_state` describes.
    #[serde(default)]
    pub target: Option<String>,
    pub client_state: Value,
    pub detected_at: DateTime<Utc>,
}

/// How a human resolved a [`SyncConflict`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "payload", rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Drop the local mutation and adopt the server's state.
    AcceptServer,
    /// Resubmit the local payload, overriding the server's check.
    AcceptClient,
    /// Resubmit a hand-merged payload.
    Merge(Value),
}

/// A queued mutation the server terminally rejected (4xx other than 409).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRejection {
    pub mutation_id: MutationId,
    pub kind: MutationKind,
    pub status: u16,
    /// Server-provided message, verbatim.
    pub message: String,
}

/// Result of one pass over the offline queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub succeeded: Vec<MutationId>,
    pub conflicted: Vec<SyncConflict>,
    pub failed: Vec<SyncRejection>,
    /// Still queued: transient failure, or blocked behind an earlier mutation
    /// of the same entity.
    pub deferred: Vec<MutationId>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty()
            && self.conflicted.is_empty()
            && self.failed.is_empty()
            && self.deferred.is_empty()
    }

    /// One-line summary for the toast layer.
    pub fn summary(&self) -> String {
        let mut msg = format!("Synced {} items", self.succeeded.len());
        if !self.failed.is_empty() {
            msg.push_str(&format!(", {} failed", self.failed.len()));
        }
        if !self.conflicted.is_empty() {
            msg.push_str(&format!(", {} need review", self.conflicted.len()));
        }
        if !self.deferred.is_empty() {
            msg.push_str(&format!(", {} still pending", self.deferred.len()));
        }
        msg
    }
}
