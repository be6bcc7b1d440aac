//! Public types for the connection supervisor.

use std::fmt;
use std::time::Duration;

/// Immutable identity of a supervised device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: String,
    display_name: String,
    log_tag: String,
}

impl DeviceIdentity {
    /// Creates an identity whose log tag is `"<name> (<id>)"`.
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let id = id.into();
        let display_name = display_name.into();
        let log_tag = format!("{display_name} ({id})");
        Self {
            id,
            display_name,
            log_tag,
        }
    }

    /// Replaces the generated log tag.
    pub fn with_log_tag(mut self, tag: impl Into<String>) -> Self {
        self.log_tag = tag.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn log_tag(&self) -> &str {
        &self.log_tag
    }
}

/// Connection state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected; initial state and the state after `disconnect()`.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected; a maintenance task is running.
    Connected,
    /// Connection lost or attempt failed; waiting to retry.
    Reconnecting,
    /// Retries exhausted. Only an explicit `connect()` leaves this state.
    Failed,
}

impl ConnectionState {
    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected | Failed, Connecting) => true,
            (Connecting, Connected | Reconnecting | Failed) => true,
            (Connected, Reconnecting) => true,
            (Reconnecting, Connecting | Failed) => true,
            _ => false,
        }
    }

    /// Whether a lifecycle is in progress (connect is a no-op here).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Retry bookkeeping, reset on every successful connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Reconnection attempts made since the last successful connect.
    pub attempt: u32,
    pub last_failure_reason: Option<String>,
    /// Delay chosen for the pending (or last) retry.
    pub next_delay: Duration,
}

/// Connection pattern a strategy implements. Selects the connect step and
/// the maintenance loop the supervisor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// Reachability probe on connect; transient session per request.
    StatelessRequest,
    /// Session opened on connect; periodic poll loop.
    Polling,
    /// Socket opened on connect; blocking receive loop.
    PersistentSocket,
    /// Third-party client owns the transport; liveness watchdog.
    ExternalClient,
    /// Receive loop and poll loop side by side.
    HybridPushPoll,
}

/// A raw inbound message handed from `receive_one` to `handle_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl RawMessage {
    /// Returns the text body, if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
