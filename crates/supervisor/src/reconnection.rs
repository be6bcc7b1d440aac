//! The per-device run task: connect, maintain, back off, retry.
//!
//! One run task exists per active lifecycle. The connect step, the
//! maintenance loop and the backoff sleep run strictly one after another,
//! and every one of them races the run's [`CancellationToken`].

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::context::LinkContext;
use crate::link::{LinkCore, MaintenanceGuard, Scope};
use crate::error::LinkError;
use crate::maintenance::{bounded, close_quietly, hybrid, poll, socket, watchdog};
use crate::strategy::ConnectionStrategy;
use crate::types::{ConnectionState, Pattern};

/// Everything the run task needs. Avoids threading separate Arcs through
/// every step.
pub(crate) struct RunContext {
    pub(crate) core: Arc<LinkCore>,
    pub(crate) strategy: Arc<dyn ConnectionStrategy>,
    pub(crate) config: SupervisorConfig,
    pub(crate) cancel: CancellationToken,
    pub(crate) first: FirstOutcome,
}

/// Hands the outcome of the first connect attempt back to `connect()`.
/// Only the first report is delivered.
#[derive(Clone)]
pub(crate) struct FirstOutcome(Arc<Mutex<Option<oneshot::Sender<ConnectionState>>>>);

impl FirstOutcome {
    pub(crate) fn new() -> (Self, oneshot::Receiver<ConnectionState>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    pub(crate) fn report(&self, state: ConnectionState) {
        if let Ok(mut guard) = self.0.lock()
            && let Some(tx) = guard.take()
        {
            let _ = tx.send(state);
        }
    }
}

/// Resources the run task opened and still has to close.
#[derive(Debug, Default)]
struct Opened {
    session: bool,
    socket: bool,
    client: bool,
}

/// Runs the lifecycle and turns a panicking hook into a failure of this
/// device only.
pub(crate) async fn supervise(rc: RunContext) {
    let core = Arc::clone(&rc.core);
    let first = rc.first.clone();

    if let Err(e) = tokio::spawn(run(rc)).await
        && e.is_panic()
    {
        error!(device = %core.tag(), "run task panicked");
        core.enter_crashed("strategy hook panicked");
        first.report(core.state());
    }
}

async fn run(rc: RunContext) {
    let tag = rc.core.tag();
    let mut opened = Opened::default();

    loop {
        let outcome = tokio::select! {
            biased;
            _ = rc.cancel.cancelled() => break,
            r = establish(&rc, &mut opened) => r,
        };

        let failure = match outcome {
            Ok(()) => {
                // Installed before Connected so no request can slip past it.
                let session_failures = rc.core.watch_sessions();
                let epoch = rc.core.enter_connected();
                rc.first.report(ConnectionState::Connected);
                match maintain(&rc, epoch, session_failures, &mut opened).await {
                    Some(err) => err,
                    None => break,
                }
            }
            Err(err) => {
                warn!(device = %tag, attempt = rc.core.attempt(), error = %err, "connect attempt failed");
                err
            }
        };

        release(&rc, &mut opened, false).await;
        if rc.cancel.is_cancelled() {
            break;
        }

        rc.core.enter_reconnecting(&failure);
        let attempt = rc.core.attempt();

        if !rc.config.reconnect || rc.config.retry.is_exhausted(attempt) {
            let reason = if rc.config.reconnect {
                LinkError::Exhausted { attempts: attempt }.to_string()
            } else {
                format!("reconnection disabled: {failure}")
            };
            release(&rc, &mut opened, true).await;
            rc.core.enter_failed(&reason);
            rc.first.report(ConnectionState::Failed);
            return;
        }

        rc.first.report(ConnectionState::Reconnecting);
        let delay = rc.config.retry.next_delay(attempt);
        rc.core.schedule_retry(delay);
        info!(
            device = %tag,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );

        tokio::select! {
            biased;
            _ = rc.cancel.cancelled() => {
                debug!(device = %tag, "reconnect cancelled");
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        rc.core.begin_retry();
    }

    release(&rc, &mut opened, true).await;
    debug!(device = %tag, "run task stopped");
}

/// The pattern's connect step.
async fn establish(rc: &RunContext, opened: &mut Opened) -> Result<(), LinkError> {
    let s = rc.strategy.as_ref();
    let limit = rc.config.hook_timeout;

    match s.pattern() {
        Pattern::StatelessRequest => bounded("probe_reachable", limit, s.probe_reachable()).await,
        Pattern::Polling => {
            bounded("open_session", limit, s.open_session()).await?;
            opened.session = true;
            Ok(())
        }
        Pattern::PersistentSocket => {
            bounded("open_socket", limit, s.open_socket()).await?;
            opened.socket = true;
            Ok(())
        }
        Pattern::ExternalClient => establish_client(rc, opened).await,
        Pattern::HybridPushPoll => {
            bounded("open_session", limit, s.open_session()).await?;
            opened.session = true;
            match bounded("open_socket", limit, s.open_socket()).await {
                Ok(()) => opened.socket = true,
                Err(e) if rc.config.keep_polling_on_push_loss => {
                    warn!(device = %rc.core.tag(), error = %e, "push channel unavailable, polling only");
                }
                Err(e) => return Err(e),
            }
            Ok(())
        }
    }
}

/// Connect step for externally managed clients. A bound client that came
/// back on its own is reused as is.
async fn establish_client(rc: &RunContext, opened: &mut Opened) -> Result<(), LinkError> {
    let s = rc.strategy.as_ref();
    let limit = rc.config.hook_timeout;
    let tag = rc.core.tag();

    if opened.client {
        if s.is_client_alive() {
            info!(device = %tag, "external client recovered on its own");
            return Ok(());
        }
        close_quietly("unbind_client_events", limit, tag, s.unbind_client_events()).await;
        rc.core.unbind_client();
        opened.client = false;
    }

    bounded("create_external_client", limit, s.create_external_client()).await?;
    let binding = rc.core.bind_client();
    let ctx = LinkContext::new(Arc::clone(&rc.core), Scope::Binding(binding));
    if let Err(e) = bounded("bind_client_events", limit, s.bind_client_events(ctx)).await {
        // Undo whatever part of the binding the strategy managed to install.
        close_quietly("unbind_client_events", limit, tag, s.unbind_client_events()).await;
        rc.core.unbind_client();
        return Err(e);
    }
    opened.client = true;
    Ok(())
}

/// Runs the pattern's maintenance until it fails (`Some`) or the run is
/// cancelled (`None`).
async fn maintain(
    rc: &RunContext,
    epoch: u64,
    mut session_failures: mpsc::Receiver<LinkError>,
    opened: &mut Opened,
) -> Option<LinkError> {
    let s = rc.strategy.as_ref();
    let config = &rc.config;
    let tag = rc.core.tag();
    let pattern = s.pattern();

    // Stateless devices have no maintenance task; only failed requests
    // can take them out of Connected.
    let _guard = (pattern != Pattern::StatelessRequest).then(|| MaintenanceGuard::enter(&rc.core));
    let ctx = LinkContext::new(Arc::clone(&rc.core), Scope::Epoch(epoch));

    let work = async {
        match pattern {
            Pattern::StatelessRequest => match session_failures.recv().await {
                Some(err) => err,
                None => std::future::pending().await,
            },
            Pattern::Polling => {
                poll::poll_loop(s, &ctx, config.poll_interval, config.hook_timeout).await
            }
            Pattern::PersistentSocket => socket::receive_loop(s, &ctx, config).await,
            Pattern::ExternalClient => {
                watchdog::watchdog_loop(s, tag, config.watchdog_interval).await
            }
            Pattern::HybridPushPoll => hybrid::hybrid_loop(s, &ctx, config, &mut opened.socket).await,
        }
    };

    let result = tokio::select! {
        biased;
        _ = rc.cancel.cancelled() => None,
        err = work => Some(err),
    };
    debug!(device = %tag, cancelled = result.is_none(), "maintenance stopped");
    result
}

/// Closes what the run opened. The external client survives a failure so
/// the next attempt can see whether it recovered; `full` unbinds it too.
async fn release(rc: &RunContext, opened: &mut Opened, full: bool) {
    let s = rc.strategy.as_ref();
    let limit = rc.config.hook_timeout;
    let tag = rc.core.tag();

    if opened.socket {
        close_quietly("close_socket", limit, tag, s.close_socket()).await;
        opened.socket = false;
    }
    if opened.session {
        close_quietly("close_session", limit, tag, s.close_session()).await;
        opened.session = false;
    }
    if full && opened.client {
        close_quietly("unbind_client_events", limit, tag, s.unbind_client_events()).await;
        rc.core.unbind_client();
        opened.client = false;
    }
}
