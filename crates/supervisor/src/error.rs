//! Error types for connection supervision.

use devlink_events::ErrorKind;

/// Failure reported by a strategy hook or by the supervisor itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("external client failure: {0}")]
    ExternalFailure(String),

    #[error("retries exhausted after {attempts} attempt(s)")]
    Exhausted { attempts: u32 },

    #[error("strategy does not implement `{0}`")]
    Unsupported(&'static str),

    #[error("device is not connected")]
    NotConnected,
}

impl LinkError {
    /// Category carried in error events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable(_) => ErrorKind::Unreachable,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ExternalFailure(_) => ErrorKind::ExternalFailure,
            Self::Exhausted { .. } => ErrorKind::Exhausted,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::NotConnected => ErrorKind::NotConnected,
        }
    }

    /// Whether a failed transient session means the device itself is gone.
    pub(crate) fn is_connectivity_loss(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }
}

/// Errors from reading device records.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("device record has an empty id")]
    MissingId,

    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}
