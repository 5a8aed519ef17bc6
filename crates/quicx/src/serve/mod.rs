//! Accept loop dispatching connections to a handler.

use crate::Listener;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};


/// First delay after a failed accept.
pub const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);

/// Upper bound for the delay between failed accepts.
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Per-connection callback invoked by [`serve`].
///
/// Implemented for any `Fn(CancellationToken, C) -> impl Future<Output = ()>`.
#[async_trait]
pub trait Handler<C>: Send + Sync {
    /// Handle one connection.
    ///
    /// `ctx` is cancelled when the loop's token is.
    async fn handle(&self, ctx: CancellationToken, conn: C);
}

#[async_trait]
impl<C, F, Fut> Handler<C> for F
where
    C: Send + 'static,
    F: Fn(CancellationToken, C) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, ctx: CancellationToken, conn: C) {
        (self)(ctx, conn).await
    }
}

/// Outcome of one loop iteration.
enum Step {
    Handled,
    Retry,
    Closed,
}

/// Accept connections from `listener` and hand each to `handler` until
/// `cancel` fires or the listener is closed.
///
/// Connections are handled one at a time: the handler is awaited before the
/// next accept. Cancellation is checked before each accept; an accept already
/// waiting is only interrupted by closing the listener, which this loop never
/// does itself.
///
/// Accept errors are logged and retried with a backoff from
/// [`ACCEPT_BACKOFF_MIN`] doubling up to [`ACCEPT_BACKOFF_MAX`], reset by the
/// next successful accept. An error for which [`Error::is_closed`] holds ends
/// the loop. A panic in accept or in the handler is caught and logged, and
/// the loop carries on.
///
/// [`Error::is_closed`]: crate::Error::is_closed
pub async fn serve<L, H>(cancel: CancellationToken, listener: &L, handler: &H)
where
    L: Listener + ?Sized,
    H: Handler<L::Conn> + ?Sized,
{
    let mut backoff = Duration::ZERO;
    loop {
        if cancel.is_cancelled() {
            debug!("serve loop cancelled");
            return;
        }

        let step = AssertUnwindSafe(serve_one(&cancel, listener, handler))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                error!(panic = panic_message(&*panic), "serve iteration panicked");
                Step::Retry
            });

        match step {
            Step::Handled => backoff = Duration::ZERO,
            Step::Closed => return,
            Step::Retry => {
                backoff = (backoff * 2).clamp(ACCEPT_BACKOFF_MIN, ACCEPT_BACKOFF_MAX);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("serve loop cancelled during backoff");
                        return;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

async fn serve_one<L, H>(cancel: &CancellationToken, listener: &L, handler: &H) -> Step
where
    L: Listener + ?Sized,
    H: Handler<L::Conn> + ?Sized,
{
    match listener.accept().await {
        Ok(conn) => {
            handler.handle(cancel.child_token(), conn).await;
            Step::Handled
        }
        Err(e) if e.is_closed() => {
            info!("listener closed, serve loop exiting");
            Step::Closed
        }
        Err(e) => {
            warn!(error = %e, "accept failed");
            Step::Retry
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
