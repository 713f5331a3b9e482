//! The module side of the host/module boundary.
//!
//! A submodule library links its own copy of this crate, of `std` and of
//! every other dependency. Its thread-locals are separate from the host's,
//! and a panic raised by its code can only be caught by its own copy of
//! `catch_unwind`; the host's copy aborts on it.
//!
//! The types here are instantiated by module code (`declare_programs!` and
//! the generic [`SubmoduleCommands`](crate::SubmoduleCommands) methods), so
//! they run the module's copy:
//!
//! ```text
//! host pump ──► ModuleFuture ──► GuardedFuture ─┬─► install ambient context + dispatcher
//! (host copy)                    (module copy)  ├─► poll program future
//!                                               └─► panic ──► Err("panicked: ...")
//! ```

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tracing::Dispatch;
use tracing::level_filters::LevelFilter;

use crate::cleanup::panic_message;
use crate::context::ExecutionContext;

/// Each copy of `tracing` starts with every callsite disabled until it has
/// seen a dispatcher; the host's was created in another copy.
static INTEREST_BUILT: AtomicBool = AtomicBool::new(false);

/// Ambient state module code needs while it runs: the execution context and
/// the host's logging dispatcher.
///
/// Captured on the host side when dependencies are created, entered on the
/// module side around every call into module code.
#[derive(Clone)]
pub struct ModuleScope {
    context: ExecutionContext,
    dispatch: Dispatch,
}

impl ModuleScope {
    /// Scope around `context` that logs to the calling thread's default dispatcher.
    pub fn capture(context: ExecutionContext) -> Self {
        Self {
            context,
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Run `f` with the context as ambient context and the captured dispatcher
    /// as the default one.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, || {
            if !INTEREST_BUILT.load(Ordering::Acquire)
                && self.dispatch.max_level_hint() != Some(LevelFilter::OFF)
                && !INTEREST_BUILT.swap(true, Ordering::AcqRel)
            {
                tracing::callsite::rebuild_interest_cache();
            }
            self.context.run_with_context(f)
        })
    }

    /// [`enter`](Self::enter), reporting a panic in `f` as an error.
    pub fn call<T>(
        &self,
        what: &str,
        f: impl FnOnce() -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        self.enter(|| match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!(
                "panicked in {}: {}",
                what,
                panic_message(payload.as_ref())
            )),
        })
    }

    /// Poll and drop `future` inside this scope, reporting panics as errors.
    pub fn guard(
        &self,
        future: BoxFuture<'static, anyhow::Result<()>>,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(GuardedFuture {
            future: Some(future),
            scope: self.clone(),
        })
    }
}

impl std::fmt::Debug for ModuleScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleScope")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

struct GuardedFuture {
    future: Option<BoxFuture<'static, anyhow::Result<()>>>,
    scope: ModuleScope,
}

impl GuardedFuture {
    fn release(&mut self) {
        let Some(future) = self.future.take() else {
            return;
        };
        self.scope.enter(|| {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(move || drop(future))) {
                tracing::error!(
                    "Dropping a module operation panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        });
    }
}

impl Future for GuardedFuture {
    type Output = anyhow::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let Some(future) = this.future.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let polled = this
            .scope
            .enter(|| catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx))));
        let output = match polled {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(output)) => output,
            Err(payload) => Err(anyhow::anyhow!(
                "panicked: {}",
                panic_message(payload.as_ref())
            )),
        };

        this.release();
        Poll::Ready(output)
    }
}

impl Drop for GuardedFuture {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_call_reports_panic() {
        let scope = ModuleScope::capture(ExecutionContext::new());
        let result: anyhow::Result<()> = scope.call("handler", || panic!("torn scroll"));
        let message = result.unwrap_err().to_string();
        assert!(message.contains("panicked in handler"));
        assert!(message.contains("torn scroll"));
    }

    #[test]
    fn test_enter_installs_ambient_context() {
        let context = ExecutionContext::new();
        let scope = ModuleScope::capture(context.clone());

        assert!(!context.is_current());
        assert!(scope.enter(|| context.is_current()));
        assert!(ExecutionContext::current().is_none());
    }

    #[test]
    fn test_guarded_future_turns_panic_into_error() {
        let scope = ModuleScope::capture(ExecutionContext::new());
        let future = scope.guard(
            async {
                if true {
                    panic!("fell off the boat");
                }
                Ok::<(), anyhow::Error>(())
            }
            .boxed(),
        );

        let error = futures::executor::block_on(future).unwrap_err();
        assert!(error.to_string().contains("fell off the boat"));
    }

    #[test]
    fn test_guarded_future_polls_inside_scope() {
        let context = ExecutionContext::new();
        let scope = ModuleScope::capture(context.clone());

        let check = context.clone();
        let future = scope.guard(
            async move {
                anyhow::ensure!(check.is_current(), "not inside the scope");
                Ok(())
            }
            .boxed(),
        );

        assert!(futures::executor::block_on(future).is_ok());
    }
}
