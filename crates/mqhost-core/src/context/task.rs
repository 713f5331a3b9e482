//! Operations scheduled on the execution context.
//!
//! A task owns a boxed future that is only ever polled from a pump. Its waker
//! posts a poll continuation back to the context queue, so every resumption of
//! the operation happens inside the context regardless of which thread woke it.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::task::{ArcWake, waker_ref};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cleanup::panic_message;

use super::executor::ContextInner;

/// Error a cancelled operation returns to report that it observed cancellation.
///
/// An operation that completes with this error is recorded as
/// [`TaskStatus::Cancelled`] rather than [`TaskStatus::Faulted`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCancelled;

impl fmt::Display for OperationCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation was cancelled")
    }
}

impl std::error::Error for OperationCancelled {}

/// Lifecycle of a scheduled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Spawned but not polled yet.
    Scheduled,
    /// Polled at least once and suspended.
    Running,
    /// Ran to completion.
    Completed,
    /// Completed with an error or panicked.
    Faulted,
    /// Observed cancellation or was disposed before completing.
    Cancelled,
}

impl TaskStatus {
    /// Whether the operation will never be polled again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Faulted | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Faulted => "Faulted",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(text)
    }
}

/// A fault nobody observed before the operation was dropped.
#[derive(Debug, Clone)]
pub struct TaskFault {
    pub task_name: String,
    pub message: String,
}

impl fmt::Display for TaskFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unobserved fault in {}: {}", self.task_name, self.message)
    }
}

struct TaskState {
    status: TaskStatus,
    error: Option<anyhow::Error>,
    observed: bool,
}

pub(crate) struct Task {
    name: String,
    future: Mutex<Option<BoxFuture<'static, anyhow::Result<()>>>>,
    state: Mutex<TaskState>,
    /// A poll continuation is already queued.
    scheduled: AtomicBool,
    /// `dispose` was requested while the future was being polled.
    dispose_requested: AtomicBool,
    cancel: Option<CancellationToken>,
    context: Weak<ContextInner>,
}

impl Task {
    pub(crate) fn new(
        name: String,
        future: BoxFuture<'static, anyhow::Result<()>>,
        cancel: Option<CancellationToken>,
        context: Weak<ContextInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            future: Mutex::new(Some(future)),
            state: Mutex::new(TaskState {
                status: TaskStatus::Scheduled,
                error: None,
                observed: false,
            }),
            scheduled: AtomicBool::new(false),
            dispose_requested: AtomicBool::new(false),
            cancel,
            context,
        })
    }

    /// Queue a poll on the owning context unless one is already queued.
    pub(crate) fn schedule(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.context.upgrade() {
            Some(context) => {
                let task = Arc::clone(self);
                context.enqueue(Box::new(move || task.poll()));
            }
            None => {
                tracing::debug!("Context for task {} is gone, dropping wake-up", self.name);
            }
        }
    }

    fn poll(self: &Arc<Self>) {
        self.scheduled.store(false, Ordering::Release);

        // Re-entrant pump while this task is mid-poll: try again next pump.
        let Some(mut slot) = self.future.try_lock() else {
            self.schedule();
            return;
        };

        if slot.is_none() {
            return;
        }

        let status = self.state.lock().status;
        if status == TaskStatus::Scheduled
            && self.cancel.as_ref().is_some_and(|token| token.is_cancelled())
        {
            let future = slot.take();
            drop(slot);
            drop(future);
            self.finish(TaskStatus::Cancelled, None);
            return;
        }

        if status == TaskStatus::Scheduled {
            self.state.lock().status = TaskStatus::Running;
        }

        let waker = waker_ref(self);
        let mut cx = Context::from_waker(&waker);
        let polled = match slot.as_mut() {
            Some(future) => catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))),
            None => return,
        };

        match polled {
            Ok(Poll::Pending) => {
                if self.dispose_requested.load(Ordering::Acquire) {
                    let future = slot.take();
                    drop(slot);
                    drop(future);
                    self.finish(TaskStatus::Cancelled, None);
                }
            }
            Ok(Poll::Ready(output)) => {
                let future = slot.take();
                drop(slot);
                drop(future);
                match output {
                    Ok(()) => self.finish(TaskStatus::Completed, None),
                    Err(e) if e.downcast_ref::<OperationCancelled>().is_some() => {
                        self.finish(TaskStatus::Cancelled, None)
                    }
                    Err(e) => self.finish(TaskStatus::Faulted, Some(e)),
                }
            }
            Err(payload) => {
                let future = slot.take();
                drop(slot);
                drop(future);
                let message = format!("panicked: {}", panic_message(payload.as_ref()));
                self.finish(TaskStatus::Faulted, Some(anyhow::anyhow!(message)));
            }
        }
    }

    fn finish(&self, status: TaskStatus, error: Option<anyhow::Error>) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        state.status = status;
        state.error = error;
        tracing::trace!("Task {} finished with status {}", self.name, status);
    }

    fn dispose_future(&self) {
        self.dispose_requested.store(true, Ordering::Release);

        // If the future is being polled right now, the poll drops it on return.
        let Some(mut slot) = self.future.try_lock() else {
            return;
        };
        let future = slot.take();
        drop(slot);

        if future.is_some() {
            drop(future);
            self.finish(TaskStatus::Cancelled, None);
        }
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.status != TaskStatus::Faulted || state.observed {
            return;
        }

        let fault = TaskFault {
            task_name: self.name.clone(),
            message: state
                .error
                .as_ref()
                .map(|e| format!("{:#}", e))
                .unwrap_or_else(|| "unknown error".to_string()),
        };

        match self.context.upgrade() {
            Some(context) => context.report_unobserved(fault),
            None => tracing::error!("{}", fault),
        }
    }
}

/// The host's side of a [`TaskHandle`], reached through a vtable so a
/// submodule's copy of this crate never runs task code of its own.
pub(crate) trait TaskControl: Send + Sync {
    fn name(&self) -> &str;
    fn status(&self) -> TaskStatus;
    fn error_message(&self) -> Option<String>;
    fn take_error(&self) -> Option<anyhow::Error>;
    fn dispose(&self);
}

impl TaskControl for Task {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    fn error_message(&self) -> Option<String> {
        self.state.lock().error.as_ref().map(|e| format!("{:#}", e))
    }

    fn take_error(&self) -> Option<anyhow::Error> {
        let mut state = self.state.lock();
        state.observed = true;
        state.error.take()
    }

    fn dispose(&self) {
        self.dispose_future();
    }
}

/// Handle to an operation running on an [`ExecutionContext`](super::ExecutionContext).
///
/// Cloning the handle shares the same operation. Dropping every handle does
/// not stop the operation while it still has pending wake-ups; use
/// [`TaskHandle::dispose`] for forced termination.
#[derive(Clone)]
pub struct TaskHandle {
    task: Arc<dyn TaskControl>,
}

impl TaskHandle {
    pub(crate) fn new(task: Arc<Task>) -> Self {
        Self { task }
    }

    /// Name given at spawn time.
    pub fn name(&self) -> &str {
        self.task.name()
    }

    /// Current status.
    pub fn status(&self) -> TaskStatus {
        self.task.status()
    }

    /// Whether the operation has finished in any way.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Message of the recorded fault, without marking it observed.
    pub fn error_message(&self) -> Option<String> {
        self.task.error_message()
    }

    /// Take the recorded fault, marking it observed.
    pub fn take_error(&self) -> Option<anyhow::Error> {
        self.task.take_error()
    }

    /// Drop the operation's future, terminating it at its current suspension point.
    ///
    /// A non-terminal operation becomes [`TaskStatus::Cancelled`].
    pub fn dispose(&self) {
        self.task.dispose();
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}
