//! Maintenance loops: the work that keeps a connected device connected.
//!
//! Each loop runs until its first failure and returns it. Cancellation is
//! done by the caller dropping the loop's future.

pub(crate) mod hybrid;
pub(crate) mod poll;
pub(crate) mod socket;
pub(crate) mod watchdog;

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::LinkError;

/// Runs a hook with an upper time bound.
pub(crate) async fn bounded<T, F>(hook: &'static str, limit: Duration, fut: F) -> Result<T, LinkError>
where
    F: Future<Output = Result<T, LinkError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(LinkError::Timeout(format!(
            "{hook} took longer than {limit:?}"
        ))),
    }
}

/// Runs a teardown hook; failures are logged and otherwise ignored.
pub(crate) async fn close_quietly<F>(hook: &'static str, limit: Duration, tag: &str, fut: F)
where
    F: Future<Output = Result<(), LinkError>>,
{
    if let Err(e) = bounded(hook, limit, fut).await {
        debug!(device = %tag, hook, error = %e, "teardown hook failed");
    }
}
