//! The continuation queue and its pump.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::task::{Task, TaskFault, TaskHandle};

/// A unit of work queued on the context.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Callback invoked with faults that nobody observed.
pub type FaultHandler = Arc<dyn Fn(TaskFault) + Send + Sync + 'static>;

thread_local! {
    static CURRENT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

pub(crate) struct ContextInner {
    queue: Mutex<VecDeque<Continuation>>,
    runtime: Option<Handle>,
    fault_handler: RwLock<FaultHandler>,
}

impl ContextInner {
    pub(crate) fn enqueue(&self, continuation: Continuation) {
        self.queue.lock().push_back(continuation);
    }

    /// Log the fault now and deliver it to the handler on the next pump.
    pub(crate) fn report_unobserved(&self, fault: TaskFault) {
        tracing::error!("{}", fault);
        let handler = Arc::clone(&*self.fault_handler.read());
        self.enqueue(Box::new(move || handler(fault)));
    }

    fn run_snapshot(&self) -> usize {
        let batch: Vec<Continuation> = self.queue.lock().drain(..).collect();
        let count = batch.len();
        if count == 0 {
            return 0;
        }

        let _runtime = self.runtime.as_ref().map(Handle::enter);
        for continuation in batch {
            continuation();
        }

        tracing::trace!("Pumped {} continuations", count);
        count
    }
}

/// The host's side of an [`ExecutionContext`].
///
/// Submodule libraries link their own copy of this crate. Everything that
/// touches the queue, the runtime or task state is reached through this
/// trait, so it always runs the code of the copy that created the context.
pub(crate) trait ContextCore: Send + Sync {
    fn enqueue(&self, continuation: Continuation);
    fn pump(&self, ambient: Option<ExecutionContext>) -> usize;
    fn clear_queue(&self) -> usize;
    fn pending(&self) -> usize;
    fn set_fault_handler(&self, handler: FaultHandler);
    fn spawn(
        self: Arc<Self>,
        name: String,
        future: BoxFuture<'static, anyhow::Result<()>>,
        cancel: Option<CancellationToken>,
    ) -> TaskHandle;
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
    fn has_runtime(&self) -> bool;
}

impl ContextCore for ContextInner {
    fn enqueue(&self, continuation: Continuation) {
        ContextInner::enqueue(self, continuation);
    }

    fn pump(&self, ambient: Option<ExecutionContext>) -> usize {
        match ambient {
            Some(context) => context.run_with_context(|| self.run_snapshot()),
            None => self.run_snapshot(),
        }
    }

    fn clear_queue(&self) -> usize {
        let dropped: Vec<Continuation> = self.queue.lock().drain(..).collect();
        dropped.len()
    }

    fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn set_fault_handler(&self, handler: FaultHandler) {
        *self.fault_handler.write() = handler;
    }

    fn spawn(
        self: Arc<Self>,
        name: String,
        future: BoxFuture<'static, anyhow::Result<()>>,
        cancel: Option<CancellationToken>,
    ) -> TaskHandle {
        let task = Task::new(name, future, cancel, Arc::downgrade(&self));
        task.schedule();
        TaskHandle::new(task)
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let runtime = self
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok());
        match runtime {
            Some(runtime) => {
                let _entered = runtime.enter();
                Box::pin(tokio::time::sleep(duration))
            }
            None => {
                tracing::warn!(
                    "No runtime to time a {:?} sleep; it only ends when cancelled",
                    duration
                );
                Box::pin(std::future::pending())
            }
        }
    }

    fn has_runtime(&self) -> bool {
        self.runtime.is_some()
    }
}

/// Single serialization point for calls into the host.
///
/// Continuations posted from any thread run in FIFO order, and only when the
/// host thread calls [`pump`](Self::pump). Futures started with
/// [`spawn`](Self::spawn) are polled exclusively from a pump, so every
/// resumption of an operation happens on the host thread.
///
/// Cloning an `ExecutionContext` yields another handle to the same queue.
#[derive(Clone)]
pub struct ExecutionContext {
    core: Arc<dyn ContextCore>,
}

impl ExecutionContext {
    /// Create a context with no runtime of its own.
    ///
    /// [`sleep`](Self::sleep) falls back to the runtime the caller is running in, if any.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a context whose pumps and timers use `runtime`.
    pub fn with_runtime(runtime: Handle) -> Self {
        Self::build(Some(runtime))
    }

    fn build(runtime: Option<Handle>) -> Self {
        let default_handler: FaultHandler = Arc::new(|fault: TaskFault| {
            tracing::debug!("No fault handler installed for {}", fault.task_name);
        });
        Self {
            core: Arc::new(ContextInner {
                queue: Mutex::new(VecDeque::new()),
                runtime,
                fault_handler: RwLock::new(default_handler),
            }),
        }
    }

    /// Replace the handler that receives unobserved faults.
    ///
    /// The handler runs inside a pump, so it may call the host.
    pub fn set_fault_handler(&self, handler: impl Fn(TaskFault) + Send + Sync + 'static) {
        self.core.set_fault_handler(Arc::new(handler));
    }

    /// Queue `continuation` to run on the next pump. Never blocks on the pump.
    pub fn post(&self, continuation: impl FnOnce() + Send + 'static) {
        self.core.enqueue(Box::new(continuation));
    }

    /// Synchronous cross-thread execution is not supported.
    pub fn send(&self, _continuation: impl FnOnce() + Send + 'static) -> Result<()> {
        Err(Error::Unsupported(
            "synchronous send on the cooperative execution context",
        ))
    }

    /// Run everything queued at the time of the call, in order.
    ///
    /// Continuations queued while pumping run on the next pump. With
    /// `install_ambient`, the context is the thread's [`current`](Self::current)
    /// context for the duration. Returns the number of continuations run.
    ///
    /// A panicking continuation unwinds out of `pump`; the rest of the snapshot
    /// is dropped.
    pub fn pump(&self, install_ambient: bool) -> usize {
        self.core.pump(install_ambient.then(|| self.clone()))
    }

    /// Run `callback` with this context installed as the thread's ambient context.
    ///
    /// The previous ambient context is restored on every exit path, including unwinding.
    pub fn run_with_context<R>(&self, callback: impl FnOnce() -> R) -> R {
        let _guard = AmbientGuard::install(self.clone());
        callback()
    }

    /// Discard every pending continuation. Returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        self.core.clear_queue()
    }

    /// Number of continuations waiting for the next pump.
    pub fn pending(&self) -> usize {
        self.core.pending()
    }

    /// The ambient context of the calling thread, if any.
    pub fn current() -> Option<ExecutionContext> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Whether `self` is the calling thread's ambient context.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|ctx| Arc::ptr_eq(&ctx.core, &self.core))
        })
    }

    /// Start `future` as an operation whose every poll happens inside a pump.
    ///
    /// If `cancel` is already cancelled when the first poll comes around, the
    /// operation ends as cancelled without being polled.
    pub fn spawn<F>(
        &self,
        name: impl Into<String>,
        future: F,
        cancel: Option<CancellationToken>,
    ) -> TaskHandle
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::clone(&self.core).spawn(name.into(), Box::pin(future), cancel)
    }

    /// A future that completes after `duration`, timed by the context's runtime.
    pub fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.core.sleep(duration)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("pending", &self.pending())
            .field("has_runtime", &self.core.has_runtime())
            .finish()
    }
}

struct AmbientGuard {
    previous: Option<ExecutionContext>,
}

impl AmbientGuard {
    fn install(context: ExecutionContext) -> Self {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(context));
        Self { previous }
    }
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}
