//! Connection supervisor: the public handle for one device.
//!
//! `connect()` starts a background run task and waits only for its first
//! attempt; retries and maintenance continue in that task until
//! `disconnect()` cancels it.

use std::future::Future;
use std::sync::Arc;

use devlink_events::EventBus;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DeviceRecord, SupervisorConfig};
use crate::context::EntityLookup;
use crate::link::LinkCore;
use crate::error::{LinkError, RecordError};
use crate::maintenance::{bounded, close_quietly};
use crate::reconnection::{FirstOutcome, RunContext, supervise};
use crate::strategy::ConnectionStrategy;
use crate::types::{ConnectionState, DeviceIdentity, Pattern, RetryState};

struct RunHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Owns the connection lifecycle of one device.
pub struct ConnectionSupervisor {
    core: Arc<LinkCore>,
    strategy: Arc<dyn ConnectionStrategy>,
    config: SupervisorConfig,
    /// Serializes `connect`/`disconnect`.
    run: Mutex<Option<RunHandle>>,
    /// Held shared by every open transient session; `disconnect` takes it
    /// exclusively to wait for them to close.
    sessions: RwLock<()>,
}

impl ConnectionSupervisor {
    pub fn new(
        identity: DeviceIdentity,
        strategy: Arc<dyn ConnectionStrategy>,
        bus: EventBus,
        config: SupervisorConfig,
    ) -> Self {
        let core = LinkCore::new(identity, bus, serde_json::Value::Null, None);
        Self {
            core: Arc::new(core),
            strategy,
            config: config.normalized(),
            run: Mutex::new(None),
            sessions: RwLock::new(()),
        }
    }

    /// Builds a supervisor from a stored device record.
    pub fn from_record(
        record: &DeviceRecord,
        strategy: Arc<dyn ConnectionStrategy>,
        bus: EventBus,
    ) -> Result<Self, RecordError> {
        let supervisor = Self::new(record.identity()?, strategy, bus, record.supervisor_config()?);
        supervisor.core.replace_settings(record.settings.clone());
        Ok(supervisor)
    }

    pub fn with_settings(self, settings: serde_json::Value) -> Self {
        self.core.replace_settings(settings);
        self
    }

    /// Gives strategies a read-only view of the owning registry.
    pub fn with_lookup(self, lookup: Arc<dyn EntityLookup>) -> Self {
        if !self.core.set_lookup(lookup) {
            warn!(device = %self.core.tag(), "entity lookup already set, ignoring");
        }
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.core.identity
    }

    pub fn pattern(&self) -> Pattern {
        self.strategy.pattern()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn is_connected(&self) -> bool {
        self.core.state() == ConnectionState::Connected
    }

    pub fn retry_state(&self) -> RetryState {
        self.core.retry()
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Arc<serde_json::Value> {
        self.core.settings()
    }

    /// Replaces the settings. Hooks see the new value on their next call.
    pub fn update_settings(&self, settings: serde_json::Value) {
        debug!(device = %self.core.tag(), "settings updated");
        self.core.replace_settings(settings);
    }

    /// Highest number of maintenance tasks ever alive at once.
    pub fn maintenance_peak(&self) -> usize {
        self.core.maintenance_peak()
    }

    pub fn live_maintenance(&self) -> usize {
        self.core.maintenance_live()
    }

    #[cfg(test)]
    pub(crate) fn state_history(&self) -> Vec<ConnectionState> {
        self.core.history()
    }

    /// Starts the connection lifecycle and returns the state after the first
    /// attempt. A no-op returning the current state while a lifecycle is
    /// already running.
    pub async fn connect(&self) -> ConnectionState {
        let first = {
            let mut run = self.run.lock().await;
            let state = self.core.state();
            if state.is_active() {
                debug!(device = %self.core.tag(), %state, "connect ignored, lifecycle running");
                return state;
            }

            // A previous run that failed has already finished; reap it.
            if let Some(prev) = run.take() {
                prev.cancel.cancel();
                let _ = prev.join.await;
            }

            self.core.begin_connect();
            info!(device = %self.core.tag(), pattern = ?self.strategy.pattern(), "connecting");

            let (first, rx) = FirstOutcome::new();
            let cancel = CancellationToken::new();
            let rc = RunContext {
                core: Arc::clone(&self.core),
                strategy: Arc::clone(&self.strategy),
                config: self.config.clone(),
                cancel: cancel.clone(),
                first,
            };
            *run = Some(RunHandle {
                cancel,
                join: tokio::spawn(supervise(rc)),
            });
            rx
        };

        match first.await {
            Ok(state) => state,
            // Cancelled before the first attempt finished; wait for the
            // disconnect that did it.
            Err(_) => {
                let _run = self.run.lock().await;
                self.core.state()
            }
        }
    }

    /// Stops the lifecycle: cancels maintenance or backoff, waits for
    /// teardown hooks and enters `Disconnected`.
    pub async fn disconnect(&self) {
        let mut run = self.run.lock().await;
        if let Some(handle) = run.take() {
            handle.cancel.cancel();
            if let Err(e) = handle.join.await {
                warn!(device = %self.core.tag(), error = %e, "run task ended abnormally");
            }
        }
        let _drained = self.sessions.write().await;
        self.core.enter_disconnected();
    }

    /// Runs `op` inside a transient session. Stateless devices only.
    ///
    /// The session is always closed afterwards, and `disconnect()` does not
    /// return while one is open: it cancels `op` (yielding `NotConnected`)
    /// and waits for the close. A session that fails because the device is
    /// unreachable or timed out also sends the supervisor into reconnection.
    pub async fn request<T, F, Fut>(&self, op: F) -> Result<T, LinkError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, LinkError>>,
    {
        if self.strategy.pattern() != Pattern::StatelessRequest {
            return Err(LinkError::Unsupported("request"));
        }

        let (cancel, _in_flight) = {
            let run = self.run.lock().await;
            match run.as_ref() {
                Some(handle) if self.core.state() == ConnectionState::Connected => {
                    (handle.cancel.child_token(), self.sessions.read().await)
                }
                _ => return Err(LinkError::NotConnected),
            }
        };

        let tag = self.core.tag();
        let limit = self.config.hook_timeout;

        if let Err(e) = bounded("open_session", limit, self.strategy.open_session()).await {
            warn!(device = %tag, error = %e, "could not open session");
            self.report_session_failure(&e);
            return Err(e);
        }

        let result = if cancel.is_cancelled() || !self.is_connected() {
            Err(LinkError::NotConnected)
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LinkError::NotConnected),
                r = op() => r,
            }
        };
        close_quietly("close_session", limit, tag, self.strategy.close_session()).await;

        if let Err(e) = &result {
            debug!(device = %tag, error = %e, "request failed");
            self.report_session_failure(e);
        }
        result
    }

    fn report_session_failure(&self, err: &LinkError) {
        if err.is_connectivity_loss() && self.core.report_session_failure(err.clone()) {
            info!(device = %self.core.tag(), "request lost the device, reconnecting");
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.run.get_mut().take() {
            handle.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("device", &self.core.identity.id())
            .field("pattern", &self.strategy.pattern())
            .field("state", &self.core.state())
            .finish()
    }
}
