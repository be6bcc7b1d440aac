//! Poll loop — one `poll_once` per interval.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::bounded;
use crate::context::LinkContext;
use crate::error::LinkError;
use crate::strategy::ConnectionStrategy;

/// Polls immediately, then every `interval`, until a poll fails.
pub(crate) async fn poll_loop(
    strategy: &dyn ConnectionStrategy,
    ctx: &LinkContext,
    interval: Duration,
    hook_timeout: Duration,
) -> LinkError {
    let tag = ctx.identity().log_tag();
    debug!(device = %tag, interval_ms = interval.as_millis() as u64, "poll loop started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycle: u64 = 0;

    loop {
        ticker.tick().await;
        cycle += 1;
        match bounded("poll_once", hook_timeout, strategy.poll_once(ctx)).await {
            Ok(()) => trace!(device = %tag, cycle, "poll ok"),
            Err(e) => {
                warn!(device = %tag, cycle, error = %e, "poll failed");
                return e;
            }
        }
    }
}
