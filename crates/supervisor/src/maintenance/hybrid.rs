//! Hybrid maintenance: polling plus a push channel in one task.
//!
//! The poll side is authoritative. Losing the push channel is announced as a
//! non-fatal error and, when polling may continue without it, the channel is
//! reopened in the background with the retry policy's backoff.

use tracing::{debug, info, warn};

use super::poll::poll_loop;
use super::socket::receive_loop;
use super::{bounded, close_quietly};
use crate::config::SupervisorConfig;
use crate::context::LinkContext;
use crate::error::LinkError;
use crate::strategy::ConnectionStrategy;

/// Runs polling and push concurrently until one of them ends the
/// connection. `socket_open` tracks the push channel for teardown.
pub(crate) async fn hybrid_loop(
    strategy: &dyn ConnectionStrategy,
    ctx: &LinkContext,
    config: &SupervisorConfig,
    socket_open: &mut bool,
) -> LinkError {
    tokio::select! {
        err = poll_loop(strategy, ctx, config.poll_interval, config.hook_timeout) => err,
        err = push_channel(strategy, ctx, config, socket_open) => err,
    }
}

async fn push_channel(
    strategy: &dyn ConnectionStrategy,
    ctx: &LinkContext,
    config: &SupervisorConfig,
    socket_open: &mut bool,
) -> LinkError {
    let tag = ctx.identity().log_tag();
    let mut reopen_attempt: u32 = 0;

    loop {
        if *socket_open {
            let err = receive_loop(strategy, ctx, config).await;
            close_quietly("close_socket", config.hook_timeout, tag, strategy.close_socket()).await;
            *socket_open = false;

            if !config.keep_polling_on_push_loss {
                return err;
            }
            warn!(device = %tag, error = %err, "push channel lost, polling only");
            ctx.report_degraded(&err);
        }

        let delay = config.retry.next_delay(reopen_attempt);
        reopen_attempt = reopen_attempt.saturating_add(1);
        tokio::time::sleep(delay).await;

        match bounded("open_socket", config.hook_timeout, strategy.open_socket()).await {
            Ok(()) => {
                info!(device = %tag, attempts = reopen_attempt, "push channel restored");
                *socket_open = true;
                reopen_attempt = 0;
            }
            Err(e) => {
                debug!(device = %tag, attempt = reopen_attempt, error = %e, "push channel still down");
            }
        }
    }
}
