//! Publish/subscribe channel for user-facing notices (toasts).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub message: String,
    pub level: NoticeLevel,
    pub at: DateTime<Utc>,
}

/// Sink for notices. The UI decides how to render them.
pub trait Notifier: Send + Sync {
    fn show(&self, message: &str, level: NoticeLevel);
}

/// Broadcast-backed [`Notifier`]. Notices published with no subscriber are
/// dropped.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Notice>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Notifier for NotificationHub {
    fn show(&self, message: &str, level: NoticeLevel) {
        tracing::debug!(?level, message, "notice");
        let _ = self.tx.send(Notice {
            message: message.to_string(),
            level,
            at: Utc::now(),
        });
    }
}
