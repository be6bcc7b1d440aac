//! Context handed to strategy hooks.

use std::sync::Arc;

use crate::link::{LinkCore, Scope};
use crate::error::LinkError;
use crate::types::DeviceIdentity;

/// Read-only view of the owning registry, passed at construction instead
/// of a back-reference.
pub trait EntityLookup: Send + Sync {
    /// IDs of the entities of `kind` that belong to the device.
    fn entity_ids(&self, kind: &str) -> Vec<String>;
}

/// Lets a strategy publish data for the connection it was handed for.
///
/// A context is scoped: one from `poll_once`/`handle_message` is valid for
/// a single connected period, one from `bind_client_events` until the
/// client is unbound. Emitting through a stale context is a no-op.
#[derive(Clone)]
pub struct LinkContext {
    core: Arc<LinkCore>,
    scope: Scope,
}

impl LinkContext {
    pub(crate) fn new(core: Arc<LinkCore>, scope: Scope) -> Self {
        Self { core, scope }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.core.identity
    }

    pub fn device_id(&self) -> &str {
        self.core.identity.id()
    }

    /// Snapshot of the device's opaque settings.
    pub fn settings(&self) -> Arc<serde_json::Value> {
        self.core.settings()
    }

    pub fn lookup(&self) -> Option<&dyn EntityLookup> {
        self.core.lookup()
    }

    /// Publishes an `Update` event. Returns false, and publishes nothing,
    /// once this context's connection is over.
    pub fn emit_update(&self, payload: serde_json::Value) -> bool {
        self.core.emit_update(self.scope, payload)
    }

    /// Asks the owner to persist changed configuration (a refreshed token,
    /// a new address). The supervisor never writes configuration itself.
    pub fn request_config_update(&self, changes: serde_json::Value) {
        self.core.request_config_update(changes);
    }

    /// Announces a non-fatal failure for this context's connection.
    pub(crate) fn report_degraded(&self, err: &LinkError) -> bool {
        match self.scope {
            Scope::Epoch(epoch) => self.core.report_degraded(epoch, err),
            Scope::Binding(_) => false,
        }
    }

    /// Whether updates sent through this context would still be published.
    pub fn is_current(&self) -> bool {
        self.core.is_current(self.scope)
    }
}

impl std::fmt::Debug for LinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkContext")
            .field("device", &self.core.identity.id())
            .field("scope", &self.scope)
            .finish()
    }
}
