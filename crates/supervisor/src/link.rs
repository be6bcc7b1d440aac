//! Per-device state shared by the supervisor, its run task and the
//! contexts handed to strategy hooks.
//!
//! State, retry bookkeeping, connection epoch and the event sequence live
//! under one lock, and events are published while it is held. A transition
//! and the event announcing it are therefore atomic with respect to
//! `emit_update`, which is what keeps updates from landing after the
//! `Disconnected`/`Error` event that closed their connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use devlink_events::{ErrorKind, EventBus, EventKind, LifecycleEvent};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context::EntityLookup;
use crate::error::LinkError;
use crate::types::{ConnectionState, DeviceIdentity, RetryState};

/// What a [`LinkContext`](crate::LinkContext) is allowed to emit for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    /// One connected period.
    Epoch(u64),
    /// One external-client binding; survives early-exit reconnects.
    Binding(u64),
}

struct CoreState {
    state: ConnectionState,
    retry: RetryState,
    epoch: u64,
    binding: u64,
    next_binding: u64,
    seq: u64,
    session_failures: Option<mpsc::Sender<LinkError>>,
    #[cfg(test)]
    history: Vec<ConnectionState>,
}

pub(crate) struct LinkCore {
    pub(crate) identity: DeviceIdentity,
    bus: EventBus,
    inner: Mutex<CoreState>,
    settings: RwLock<Arc<serde_json::Value>>,
    lookup: OnceLock<Arc<dyn EntityLookup>>,
    maintenance_live: AtomicUsize,
    maintenance_peak: AtomicUsize,
}

impl LinkCore {
    pub(crate) fn new(
        identity: DeviceIdentity,
        bus: EventBus,
        settings: serde_json::Value,
        lookup: Option<Arc<dyn EntityLookup>>,
    ) -> Self {
        Self {
            identity,
            bus,
            inner: Mutex::new(CoreState {
                state: ConnectionState::Disconnected,
                retry: RetryState::default(),
                epoch: 0,
                binding: 0,
                next_binding: 0,
                seq: 0,
                session_failures: None,
                #[cfg(test)]
                history: vec![ConnectionState::Disconnected],
            }),
            settings: RwLock::new(Arc::new(settings)),
            lookup: lookup.map(OnceLock::from).unwrap_or_default(),
            maintenance_live: AtomicUsize::new(0),
            maintenance_peak: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn tag(&self) -> &str {
        self.identity.log_tag()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn retry(&self) -> RetryState {
        self.lock().retry.clone()
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.lock().retry.attempt
    }

    pub(crate) fn settings(&self) -> Arc<serde_json::Value> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn replace_settings(&self, settings: serde_json::Value) {
        *self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
    }

    pub(crate) fn lookup(&self) -> Option<&dyn EntityLookup> {
        self.lookup.get().map(|l| l.as_ref())
    }

    /// Installs the registry view. Returns false if one is already set.
    pub(crate) fn set_lookup(&self, lookup: Arc<dyn EntityLookup>) -> bool {
        self.lookup.set(lookup).is_ok()
    }

    fn publish(&self, st: &mut CoreState, kind: EventKind) {
        st.seq += 1;
        self.bus
            .publish(LifecycleEvent::new(self.identity.id(), st.seq, kind));
    }

    fn set_state(&self, st: &mut CoreState, next: ConnectionState) {
        debug_assert!(
            st.state.can_transition_to(next),
            "illegal transition {} -> {next}",
            st.state
        );
        if !st.state.can_transition_to(next) {
            error!(device = %self.tag(), from = %st.state, to = %next, "illegal state transition");
        }
        debug!(device = %self.tag(), from = %st.state, to = %next, "state change");
        st.state = next;
        #[cfg(test)]
        st.history.push(next);
    }

    /// Caller-initiated connect: `Disconnected | Failed -> Connecting`.
    pub(crate) fn begin_connect(&self) {
        let mut st = self.lock();
        self.set_state(&mut st, ConnectionState::Connecting);
        st.retry = RetryState::default();
        self.publish(&mut st, EventKind::Connecting);
    }

    /// `Reconnecting -> Connecting` after the backoff sleep.
    pub(crate) fn begin_retry(&self) {
        let mut st = self.lock();
        st.retry.attempt = st.retry.attempt.saturating_add(1);
        self.set_state(&mut st, ConnectionState::Connecting);
    }

    /// Enters `Connected`: resets retry state, opens a new epoch and
    /// announces it. Returns the epoch.
    pub(crate) fn enter_connected(&self) -> u64 {
        let mut st = self.lock();
        self.set_state(&mut st, ConnectionState::Connected);
        st.retry = RetryState::default();
        st.epoch += 1;
        self.publish(&mut st, EventKind::Connected);
        info!(device = %self.tag(), epoch = st.epoch, "connected");
        st.epoch
    }

    /// Records a failure, announces it and enters `Reconnecting`.
    pub(crate) fn enter_reconnecting(&self, err: &LinkError) {
        let mut st = self.lock();
        st.session_failures = None;
        st.retry.last_failure_reason = Some(err.to_string());
        self.publish(
            &mut st,
            EventKind::Error {
                kind: err.kind(),
                reason: err.to_string(),
                retries_exhausted: false,
            },
        );
        self.set_state(&mut st, ConnectionState::Reconnecting);
    }

    /// Announces the retry about to be slept for.
    pub(crate) fn schedule_retry(&self, delay: Duration) {
        let mut st = self.lock();
        st.retry.next_delay = delay;
        let attempt = st.retry.attempt + 1;
        self.publish(&mut st, EventKind::Reconnecting { attempt, delay });
    }

    /// `Reconnecting -> Failed`, announced by the single exhausted error.
    pub(crate) fn enter_failed(&self, reason: &str) {
        let mut st = self.lock();
        st.session_failures = None;
        self.set_state(&mut st, ConnectionState::Failed);
        self.publish(
            &mut st,
            EventKind::Error {
                kind: ErrorKind::Exhausted,
                reason: reason.to_string(),
                retries_exhausted: true,
            },
        );
        warn!(device = %self.tag(), reason, "giving up");
    }

    /// Moves a device whose run task died into `Failed`.
    pub(crate) fn enter_crashed(&self, reason: &str) {
        let state = self.state();
        if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
            self.enter_reconnecting(&LinkError::Protocol(reason.to_string()));
        }
        if self.state() == ConnectionState::Reconnecting {
            self.enter_failed(reason);
        }
    }

    /// `any -> Disconnected`. Returns false if already disconnected.
    pub(crate) fn enter_disconnected(&self) -> bool {
        let mut st = self.lock();
        st.session_failures = None;
        st.binding = 0;
        if st.state == ConnectionState::Disconnected {
            return false;
        }
        self.set_state(&mut st, ConnectionState::Disconnected);
        self.publish(&mut st, EventKind::Disconnected);
        info!(device = %self.tag(), "disconnected");
        true
    }

    /// Announces a failure that does not end the connection (hybrid push
    /// channel loss). Dropped if `epoch` is no longer connected.
    pub(crate) fn report_degraded(&self, epoch: u64, err: &LinkError) -> bool {
        let mut st = self.lock();
        if st.state != ConnectionState::Connected || st.epoch != epoch {
            return false;
        }
        self.publish(
            &mut st,
            EventKind::Degraded {
                kind: err.kind(),
                reason: err.to_string(),
            },
        );
        true
    }

    pub(crate) fn emit_update(&self, scope: Scope, payload: serde_json::Value) -> bool {
        let mut st = self.lock();
        let current = match scope {
            Scope::Epoch(e) => e == st.epoch,
            Scope::Binding(b) => b != 0 && b == st.binding,
        };
        if st.state != ConnectionState::Connected || !current {
            debug!(device = %self.tag(), ?scope, state = %st.state, "dropping late update");
            return false;
        }
        self.publish(&mut st, EventKind::Update { payload });
        true
    }

    pub(crate) fn is_current(&self, scope: Scope) -> bool {
        let st = self.lock();
        st.state == ConnectionState::Connected
            && match scope {
                Scope::Epoch(e) => e == st.epoch,
                Scope::Binding(b) => b != 0 && b == st.binding,
            }
    }

    pub(crate) fn request_config_update(&self, changes: serde_json::Value) {
        let mut st = self.lock();
        self.publish(&mut st, EventKind::ConfigUpdateRequested { changes });
    }

    /// Allocates a new external-client binding and makes it current.
    pub(crate) fn bind_client(&self) -> u64 {
        let mut st = self.lock();
        st.next_binding += 1;
        st.binding = st.next_binding;
        st.binding
    }

    pub(crate) fn unbind_client(&self) {
        self.lock().binding = 0;
    }

    /// Installs the channel transient-session failures are reported on.
    pub(crate) fn watch_sessions(&self) -> mpsc::Receiver<LinkError> {
        let (tx, rx) = mpsc::channel(1);
        self.lock().session_failures = Some(tx);
        rx
    }

    /// Reports a failed transient session. Returns false if nothing is
    /// watching (not connected, or a failure is already pending).
    pub(crate) fn report_session_failure(&self, err: LinkError) -> bool {
        let st = self.lock();
        match &st.session_failures {
            Some(tx) => tx.try_send(err).is_ok(),
            None => false,
        }
    }

    /// Every state entered so far, starting with `Disconnected`.
    #[cfg(test)]
    pub(crate) fn history(&self) -> Vec<ConnectionState> {
        self.lock().history.clone()
    }

    pub(crate) fn maintenance_live(&self) -> usize {
        self.maintenance_live.load(Ordering::SeqCst)
    }

    pub(crate) fn maintenance_peak(&self) -> usize {
        self.maintenance_peak.load(Ordering::SeqCst)
    }
}

/// Counts a running maintenance task for as long as it is alive.
pub(crate) struct MaintenanceGuard<'a> {
    core: &'a LinkCore,
}

impl<'a> MaintenanceGuard<'a> {
    pub(crate) fn enter(core: &'a LinkCore) -> Self {
        let live = core.maintenance_live.fetch_add(1, Ordering::SeqCst) + 1;
        core.maintenance_peak.fetch_max(live, Ordering::SeqCst);
        debug_assert!(live <= 1, "{live} maintenance tasks alive");
        Self { core }
    }
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.core.maintenance_live.fetch_sub(1, Ordering::SeqCst);
    }
}
