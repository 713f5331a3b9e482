//! Cooperative execution context.
//!
//! The host's API may only be called from the host's own thread, in order. All
//! work that touches the host is funnelled through one [`ExecutionContext`]:
//!
//! ```text
//!   any thread                         host thread (once per pulse)
//!   ──────────                         ────────────────────────────
//!   post(f) ───┐
//!   waker ─────┼──► [ FIFO queue ] ──► pump() ──► f1, f2, poll(task) ...
//!   fault ─────┘                                         │
//!                                                        └─► host surface
//! ```
//!
//! Operations started with [`ExecutionContext::spawn`] are polled only from
//! `pump`; their wakers post a poll back to the queue. Cancellation is
//! cooperative through [`CancellationToken`](tokio_util::sync::CancellationToken);
//! [`TaskHandle::dispose`] drops the future for forced termination.

mod executor;
mod task;

use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

pub use executor::{Continuation, ExecutionContext, FaultHandler};
pub use task::{OperationCancelled, TaskFault, TaskHandle, TaskStatus};

/// Sleep for `duration` unless `cancel` fires first.
///
/// Timed by the ambient context's runtime when there is one, which is the
/// case for every operation polled by a pump or running inside a submodule.
/// Otherwise the caller must be inside a tokio runtime.
pub async fn delay(
    duration: Duration,
    cancel: &CancellationToken,
) -> std::result::Result<(), OperationCancelled> {
    sleep_or_cancel(ambient_sleep(duration), cancel).await
}

/// A sleep timed by the ambient context, or by tokio directly without one.
pub(crate) fn ambient_sleep(duration: Duration) -> BoxFuture<'static, ()> {
    match ExecutionContext::current() {
        Some(context) => context.sleep(duration),
        None => Box::pin(tokio::time::sleep(duration)),
    }
}

pub(crate) async fn sleep_or_cancel(
    sleep: BoxFuture<'static, ()>,
    cancel: &CancellationToken,
) -> std::result::Result<(), OperationCancelled> {
    tokio::select! {
        _ = cancel.cancelled() => Err(OperationCancelled),
        _ = sleep => Ok(()),
    }
}
