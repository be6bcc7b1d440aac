//! Connection lifecycle supervision for heterogeneous devices.
//!
//! A [`ConnectionSupervisor`] owns one device's state machine, its
//! reconnection backoff and the single maintenance loop for its
//! [`Pattern`]. Protocol work is delegated to a [`ConnectionStrategy`];
//! lifecycle changes are published on a shared [`devlink_events::EventBus`].

pub mod config;
pub mod context;
pub mod error;
pub(crate) mod link;
pub(crate) mod maintenance;
pub(crate) mod reconnection;
pub mod retry;
pub mod strategy;
pub mod supervisor;
pub mod types;

#[cfg(test)]
mod scenarios;

pub use config::{DeviceRecord, KeepaliveConfig, LinkOverrides, SupervisorConfig, parse_records};
pub use context::{EntityLookup, LinkContext};
pub use error::{LinkError, RecordError};
pub use retry::RetryPolicy;
pub use strategy::{ConnectionStrategy, HookFuture};
pub use supervisor::ConnectionSupervisor;
pub use types::{ConnectionState, DeviceIdentity, Pattern, RawMessage, RetryState};
