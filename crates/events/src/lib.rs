//! Device lifecycle events and the bus that delivers them.
//!
//! A supervisor publishes [`LifecycleEvent`]s for the device it owns; the
//! owning collaborator (registry, UI bridge, logger) subscribes to one device
//! or to all of them. Publishing never blocks and never reorders events of
//! the same device.

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventHandler, Filter, Subscription};
pub use event::{ErrorKind, EventKind, LifecycleEvent};
