//! Strategy trait implemented by concrete device integrations.
//!
//! A strategy supplies the protocol side: how to open and close a session
//! or socket, how to read one message, how to poll once, how to drive an
//! external client. The supervisor only sees success or failure and time;
//! it never looks inside a hook.
//!
//! Hooks default to [`LinkError::Unsupported`], so an integration only
//! overrides the ones its [`Pattern`] uses. Teardown hooks and
//! `send_keepalive` default to success.
//!
//! Futures returned by `receive_one` and `poll_once` may be dropped at any
//! await point when the device is disconnected; they should be cancel-safe.

use std::future::Future;
use std::pin::Pin;

use crate::context::LinkContext;
use crate::error::LinkError;
use crate::types::{Pattern, RawMessage};

/// A boxed future returned by strategy hooks.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send + 'a>>;

/// Protocol hooks for one device.
///
/// Hooks are called sequentially by the supervisor, except for
/// [`Pattern::HybridPushPoll`], where `poll_once` may run while
/// `receive_one` is pending.
pub trait ConnectionStrategy: Send + Sync + 'static {
    /// Which connect step and maintenance loop the supervisor runs.
    fn pattern(&self) -> Pattern;

    /// Checks that the device answers. Connect step of
    /// [`Pattern::StatelessRequest`].
    fn probe_reachable(&self) -> HookFuture<'_, ()> {
        unsupported("probe_reachable")
    }

    /// Opens a session: the connect step of polling devices and the
    /// per-request session of stateless devices.
    fn open_session(&self) -> HookFuture<'_, ()> {
        unsupported("open_session")
    }

    fn close_session(&self) -> HookFuture<'_, ()> {
        done()
    }

    /// Performs one poll cycle. Publish changes with
    /// [`LinkContext::emit_update`].
    fn poll_once<'a>(&'a self, _ctx: &'a LinkContext) -> HookFuture<'a, ()> {
        unsupported("poll_once")
    }

    fn open_socket(&self) -> HookFuture<'_, ()> {
        unsupported("open_socket")
    }

    fn close_socket(&self) -> HookFuture<'_, ()> {
        done()
    }

    /// Waits for the next inbound message. `Ok(None)` means the peer closed
    /// the stream.
    fn receive_one(&self) -> HookFuture<'_, Option<RawMessage>> {
        unsupported("receive_one")
    }

    /// Handles one inbound message, typically by emitting an update.
    fn handle_message<'a>(&'a self, _raw: RawMessage, _ctx: &'a LinkContext) -> HookFuture<'a, ()> {
        unsupported("handle_message")
    }

    /// Sends a protocol keepalive on the open socket.
    fn send_keepalive(&self) -> HookFuture<'_, ()> {
        done()
    }

    /// Creates and starts the third-party client.
    fn create_external_client(&self) -> HookFuture<'_, ()> {
        unsupported("create_external_client")
    }

    /// Wires the client's callbacks to `ctx`. The context stays valid until
    /// `unbind_client_events` runs.
    fn bind_client_events(&self, _ctx: LinkContext) -> HookFuture<'_, ()> {
        unsupported("bind_client_events")
    }

    fn unbind_client_events(&self) -> HookFuture<'_, ()> {
        done()
    }

    /// The external client's own view of its connection.
    fn is_client_alive(&self) -> bool {
        false
    }
}

fn unsupported<'a, T: Send + 'a>(hook: &'static str) -> HookFuture<'a, T> {
    Box::pin(async move { Err(LinkError::Unsupported(hook)) })
}

fn done<'a>() -> HookFuture<'a, ()> {
    Box::pin(async { Ok(()) })
}
