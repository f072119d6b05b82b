//! Error taxonomy surfaced to the UI layer.

use serde_json::Value;
use stockcount_core::{DomainError, MutationId};
use thiserror::Error;

use crate::api::{ApiError, FailureKind};
use crate::network::NetworkState;
use crate::retry::Retryable;
use crate::storage::StorageError;

/// Failure of a data-access operation.
///
/// Only `Transport` and `Server` are absorbed by the recovery path (retry,
/// then queue or cache). Everything else reaches the user.
#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("server unreachable: {0}")]
    Transport(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The server refused the request. Displayed with the server's own wording.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("conflict: {message}")]
    Conflict {
        message: String,
        server_state: Option<Value>,
    },

    #[error("not found: {message}")]
    NotFound { message: String },

    /// Nothing cached for this entity and the server is out of reach.
    #[error("'{key}' is not available offline")]
    NotAvailableOffline { key: String },

    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("local storage failed: {0}")]
    Storage(#[from] StorageError),
}

impl OfflineError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            OfflineError::Server { status, .. } | OfflineError::Rejected { status, .. } => {
                Some(*status)
            }
            OfflineError::Conflict { .. } => Some(409),
            OfflineError::NotFound { .. } => Some(404),
            _ => None,
        }
    }

    /// True for errors the user must see as an explicit alert.
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            OfflineError::Transport(_) | OfflineError::Server { .. }
        )
    }
}

impl From<ApiError> for OfflineError {
    fn from(err: ApiError) -> Self {
        match err.kind() {
            FailureKind::Transport => OfflineError::Transport(err.to_string()),
            FailureKind::Server => OfflineError::Server {
                status: err.status_code().unwrap_or(500),
                message: err.message(),
            },
            FailureKind::Conflict => OfflineError::Conflict {
                message: err.message(),
                server_state: err.body().cloned(),
            },
            FailureKind::NotFound => OfflineError::NotFound {
                message: err.message(),
            },
            // A 2xx we could not decode has no status; report it as a rejection.
            FailureKind::Rejected => OfflineError::Rejected {
                status: err.status_code().unwrap_or(0),
                message: err.message(),
            },
        }
    }
}

impl Retryable for OfflineError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            OfflineError::Transport(_) | OfflineError::Server { .. }
        )
    }
}

/// Preconditions refused by the reconciler.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync requires an online connection (currently {0:?})")]
    NotOnline(NetworkState),

    #[error("a sync is already running")]
    AlreadyRunning,

    #[error("mutation {0} is not queued")]
    UnknownMutation(MutationId),

    #[error("mutation {0} has no pending conflict")]
    NoConflict(MutationId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
