//! Event types published by device supervisors.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure category carried by [`EventKind::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A probe or connect hook failed.
    Unreachable,
    /// Malformed or unexpected message.
    Protocol,
    /// A suspension point exceeded its configured bound.
    Timeout,
    /// An external client reported that it lost its connection.
    ExternalFailure,
    /// The retry ceiling was reached.
    Exhausted,
    /// The strategy does not implement a hook its pattern needs.
    Unsupported,
    /// An operation required a live connection.
    NotConnected,
}

/// What happened to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A caller-initiated connect started.
    Connecting,
    /// The connection is established and maintained.
    Connected,
    /// The connection was closed on request.
    Disconnected,
    /// A reconnection attempt is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// A hook failed. `retries_exhausted` is set once, when the device
    /// gives up and enters the failed state.
    Error {
        kind: ErrorKind,
        reason: String,
        retries_exhausted: bool,
    },
    /// A secondary channel failed while the connection stays up.
    Degraded { kind: ErrorKind, reason: String },
    /// Data pushed or polled from the device.
    Update { payload: serde_json::Value },
    /// The device asks its owner to persist changed configuration.
    ConfigUpdateRequested { changes: serde_json::Value },
}

/// A single event from one device.
///
/// `seq` increases strictly per device, starting at 1, and is assigned at
/// publish time under the supervisor's state lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub device_id: String,
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl LifecycleEvent {
    /// Creates an event stamped with the current time.
    pub fn new(device_id: impl Into<String>, seq: u64, kind: EventKind) -> Self {
        Self {
            device_id: device_id.into(),
            seq,
            at: Utc::now(),
            kind,
        }
    }

    /// Returns true for events that end a connected period.
    pub fn ends_connection(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Disconnected | EventKind::Error { .. }
        )
    }

    /// Returns true if this is the terminal error of an exhausted device.
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Error {
                retries_exhausted: true,
                ..
            }
        )
    }
}
