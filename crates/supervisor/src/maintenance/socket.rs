//! Receive loop for socket connections, with optional keepalive and idle
//! deadline.

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{KeepaliveConfig, SupervisorConfig};
use crate::context::LinkContext;
use crate::error::LinkError;
use crate::strategy::ConnectionStrategy;

/// Reads and dispatches messages until the stream ends or fails.
pub(crate) async fn receive_loop(
    strategy: &dyn ConnectionStrategy,
    ctx: &LinkContext,
    config: &SupervisorConfig,
) -> LinkError {
    let tag = ctx.identity().log_tag();
    debug!(device = %tag, keepalive = config.keepalive.is_some(), "receive loop started");

    match config.keepalive {
        Some(keepalive) => tokio::select! {
            err = receive(strategy, ctx, config) => err,
            err = keepalive_loop(strategy, tag, keepalive) => err,
        },
        None => receive(strategy, ctx, config).await,
    }
}

async fn receive(
    strategy: &dyn ConnectionStrategy,
    ctx: &LinkContext,
    config: &SupervisorConfig,
) -> LinkError {
    let tag = ctx.identity().log_tag();

    // Any message pushes the deadline out; without an idle timeout it never fires.
    let idle = tokio::time::sleep(config.idle_timeout.unwrap_or_default());
    tokio::pin!(idle);

    loop {
        let next = tokio::select! {
            () = &mut idle, if config.idle_timeout.is_some() => {
                warn!(device = %tag, "nothing received within idle timeout");
                return LinkError::Timeout(format!(
                    "nothing received for {:?}",
                    config.idle_timeout.unwrap_or_default()
                ));
            }
            next = strategy.receive_one() => next,
        };

        match next {
            Ok(Some(raw)) => {
                if let Some(limit) = config.idle_timeout {
                    idle.as_mut().reset(Instant::now() + limit);
                }
                trace!(device = %tag, bytes = raw.len(), "received message");
                if let Err(e) = strategy.handle_message(raw, ctx).await {
                    warn!(device = %tag, error = %e, "message handling failed");
                    return e;
                }
            }
            Ok(None) => {
                debug!(device = %tag, "stream closed by peer");
                return LinkError::Unreachable("connection closed by peer".into());
            }
            Err(e) => {
                warn!(device = %tag, error = %e, "receive failed");
                return e;
            }
        }
    }
}

/// Sends a keepalive every interval. Only a timed-out keepalive ends the
/// connection; a failed send is left for the receive side to notice.
async fn keepalive_loop(
    strategy: &dyn ConnectionStrategy,
    tag: &str,
    keepalive: KeepaliveConfig,
) -> LinkError {
    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive.interval, keepalive.interval);

    loop {
        ticker.tick().await;
        match tokio::time::timeout(keepalive.timeout, strategy.send_keepalive()).await {
            Ok(Ok(())) => trace!(device = %tag, "keepalive sent"),
            Ok(Err(e)) => debug!(device = %tag, error = %e, "keepalive failed"),
            Err(_) => {
                warn!(device = %tag, "keepalive timed out, connection dead");
                return LinkError::Timeout(format!(
                    "keepalive took longer than {:?}",
                    keepalive.timeout
                ));
            }
        }
    }
}
