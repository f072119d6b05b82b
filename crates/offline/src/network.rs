//! Tri-state connectivity classification.
//!
//! "The radio has a link" and "the server answers" are separate signals; a
//! captive portal or slow DNS gives the first without the second. Both are fed
//! in by the platform and combined into [`NetworkState`].

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Connectivity as seen by the data-access layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkState {
    /// Link up and server reachability confirmed.
    Online,
    /// Link up, reachability unconfirmed. The network path is still attempted.
    Degraded,
    /// Neither signal is up.
    Offline,
}

impl NetworkState {
    /// `OFFLINE` if neither signal is true, `DEGRADED` if there is a link but
    /// reachability is unconfirmed, `ONLINE` otherwise.
    pub fn classify(has_link: bool, reachable: bool) -> Self {
        match (has_link, reachable) {
            (false, false) => NetworkState::Offline,
            (true, false) => NetworkState::Degraded,
            _ => NetworkState::Online,
        }
    }

    /// Binary view for callers that only decide "try the network or not".
    pub fn is_usable(self) -> bool {
        self != NetworkState::Offline
    }
}

/// Physical connection type reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    None,
    Unknown,
}

impl ConnectionType {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionType::Wifi => "wifi",
            ConnectionType::Cellular => "cellular",
            ConnectionType::Ethernet => "ethernet",
            ConnectionType::None => "none",
            ConnectionType::Unknown => "unknown",
        }
    }
}

/// A classified snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub state: NetworkState,
    pub connection_type: ConnectionType,
}

/// Read access to the current connectivity classification.
///
/// `status()` is a pure read of the last known signals; it never probes.
pub trait NetworkStatusMonitor: Send + Sync {
    fn status(&self) -> NetworkStatus;

    /// Receive every classification change.
    fn subscribe(&self) -> watch::Receiver<NetworkStatus>;
}

#[derive(Debug, Clone, Copy)]
struct Signals {
    has_link: bool,
    reachable: bool,
    connection_type: ConnectionType,
}

impl Signals {
    fn status(&self) -> NetworkStatus {
        NetworkStatus {
            state: NetworkState::classify(self.has_link, self.reachable),
            connection_type: self.connection_type,
        }
    }
}

/// Monitor fed by platform callbacks (radio link) and a reachability prober.
#[derive(Debug)]
pub struct SignalMonitor {
    signals: Mutex<Signals>,
    tx: watch::Sender<NetworkStatus>,
}

impl SignalMonitor {
    /// Mobile: start with no link until the radio API reports one.
    pub fn new() -> Self {
        Self::with_signals(Signals {
            has_link: false,
            reachable: false,
            connection_type: ConnectionType::None,
        })
    }

    /// Platforms without a radio API (desktop, CLI): the link is assumed up and
    /// only reachability decides between `ONLINE` and `DEGRADED`.
    pub fn assume_link() -> Self {
        Self::with_signals(Signals {
            has_link: true,
            reachable: false,
            connection_type: ConnectionType::Unknown,
        })
    }

    fn with_signals(signals: Signals) -> Self {
        let (tx, _rx) = watch::channel(signals.status());
        Self {
            signals: Mutex::new(signals),
            tx,
        }
    }

    /// Radio link change from the platform.
    pub fn set_link(&self, has_link: bool, connection_type: ConnectionType) {
        self.update(|s| {
            s.has_link = has_link;
            s.connection_type = connection_type;
        });
    }

    /// Result of the latest reachability probe.
    pub fn set_reachable(&self, reachable: bool) {
        self.update(|s| s.reachable = reachable);
    }

    fn update(&self, f: impl FnOnce(&mut Signals)) {
        let status = {
            let mut signals = self.signals.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut signals);
            signals.status()
        };

        self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::info!(
                from = ?current.state,
                to = ?status.state,
                connection = status.connection_type.label(),
                "network state changed"
            );
            *current = status;
            true
        });
    }
}

impl Default for SignalMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkStatusMonitor for SignalMonitor {
    fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}
