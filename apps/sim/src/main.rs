//! devlink simulator entry point.
//!
//! Supervises a set of simulated devices (from a JSON file given as the
//! first argument, or the bundled set) and logs every lifecycle event.
//! Runs until Ctrl-C, or for `DEVLINK_SIM_SECS` seconds when set.

mod devices;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use devlink_events::{EventBus, EventKind, Filter, LifecycleEvent};
use devlink_supervisor::{ConnectionSupervisor, LinkError, Pattern, parse_records};

const DEFAULT_DEVICES: &str = include_str!("../devices.json");

/// How often stateless devices are sent a request.
const REQUEST_PERIOD: Duration = Duration::from_secs(4);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting devlink simulator");

    let records = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)?;
            info!(%path, "loading device records");
            parse_records(&json)?
        }
        None => parse_records(DEFAULT_DEVICES)?,
    };

    let bus = EventBus::new();
    let log_subscription = bus.subscribe(Filter::All, log_event);

    let mut supervisors = Vec::with_capacity(records.len());
    for record in &records {
        let strategy = devices::build(record)?;
        let sup = ConnectionSupervisor::from_record(record, strategy, bus.clone())?;
        supervisors.push(Arc::new(sup));
    }
    info!(devices = supervisors.len(), "supervisors ready");

    let mut connects = JoinSet::new();
    for sup in &supervisors {
        let sup = Arc::clone(sup);
        connects.spawn(async move {
            let state = sup.connect().await;
            info!(device = %sup.identity().log_tag(), %state, "initial connect finished");
        });
    }
    while connects.join_next().await.is_some() {}

    let mut requesters = JoinSet::new();
    for sup in supervisors
        .iter()
        .filter(|s| s.pattern() == Pattern::StatelessRequest)
    {
        requesters.spawn(drive_requests(Arc::clone(sup)));
    }

    let run_for = std::env::var("DEVLINK_SIM_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);
    match run_for {
        Some(limit) => tokio::time::sleep(limit).await,
        None => tokio::signal::ctrl_c().await?,
    }

    info!("shutting down");
    requesters.shutdown().await;
    for sup in &supervisors {
        sup.disconnect().await;
    }
    log_subscription.finish().await;
    info!("simulator stopped");
    Ok(())
}

/// Periodically toggles a stateless device through `request`.
async fn drive_requests(sup: Arc<ConnectionSupervisor>) {
    let mut ticker = tokio::time::interval(REQUEST_PERIOD);
    let mut on = false;
    loop {
        ticker.tick().await;
        on = !on;
        let result = sup
            .request(|| async move {
                tokio::time::sleep(Duration::from_millis(15)).await;
                Ok::<_, LinkError>(serde_json::json!({ "power": on }))
            })
            .await;
        match result {
            Ok(reply) => debug!(device = %sup.identity().log_tag(), %reply, "request ok"),
            Err(LinkError::NotConnected) => {}
            Err(e) => warn!(device = %sup.identity().log_tag(), error = %e, "request failed"),
        }
    }
}

fn log_event(event: LifecycleEvent) {
    let device = event.device_id.as_str();
    let seq = event.seq;
    match &event.kind {
        EventKind::Connecting => info!(device, seq, "event: connecting"),
        EventKind::Connected => info!(device, seq, "event: connected"),
        EventKind::Disconnected => info!(device, seq, "event: disconnected"),
        EventKind::Reconnecting { attempt, delay } => info!(
            device,
            seq,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "event: reconnecting"
        ),
        EventKind::Error { kind, reason, .. } if event.is_exhausted() => {
            error!(device, seq, ?kind, %reason, "event: gave up")
        }
        EventKind::Error { kind, reason, .. } => {
            warn!(device, seq, ?kind, %reason, "event: error")
        }
        EventKind::Degraded { kind, reason } => {
            warn!(device, seq, ?kind, %reason, "event: degraded")
        }
        EventKind::Update { payload } => debug!(device, seq, %payload, "event: update"),
        EventKind::ConfigUpdateRequested { changes } => {
            info!(device, seq, %changes, "event: config update requested")
        }
    }
}
