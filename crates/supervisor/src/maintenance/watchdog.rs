//! Liveness watchdog for externally managed clients.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::LinkError;
use crate::strategy::ConnectionStrategy;

/// Checks `is_client_alive` every `interval` until it reads false.
pub(crate) async fn watchdog_loop(
    strategy: &dyn ConnectionStrategy,
    tag: &str,
    interval: Duration,
) -> LinkError {
    debug!(device = %tag, interval_ms = interval.as_millis() as u64, "watchdog started");
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut checks: u64 = 0;

    loop {
        ticker.tick().await;
        checks += 1;
        if !strategy.is_client_alive() {
            warn!(device = %tag, checks, "external client reports disconnected");
            return LinkError::ExternalFailure("client reports disconnected".into());
        }
        trace!(device = %tag, checks, "client alive");
    }
}
