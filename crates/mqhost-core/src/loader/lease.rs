//! Keeping a module's code mapped while anything built from it is alive.
//!
//! Program instances, their futures and the command handlers they register
//! all contain code from the submodule library. Each of them carries a
//! [`ModuleLease`]; the library is closed only when the domain has been
//! unloaded and the last lease is gone.

use std::ffi::OsString;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use libloading::Library;

use crate::cleanup::panic_message;
use crate::context::OperationCancelled;

use super::shadow::ShadowCopy;

/// Libraries loaded for one module domain.
pub(crate) struct LoadedModule {
    pub(crate) name: String,
    main: Option<Library>,
    private: Vec<(OsString, Library)>,
    shadow: Option<ShadowCopy>,
}

impl LoadedModule {
    pub(crate) fn new(
        name: String,
        main: Library,
        private: Vec<(OsString, Library)>,
        shadow: Option<ShadowCopy>,
    ) -> Self {
        Self {
            name,
            main: Some(main),
            private,
            shadow,
        }
    }

    pub(crate) fn library(&self) -> Option<&Library> {
        self.main.as_ref()
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        // The submodule library goes first; it may depend on its private libraries.
        if let Some(main) = self.main.take() {
            if let Err(e) = main.close() {
                tracing::debug!("Closing library of {} failed: {}", self.name, e);
            }
        }

        for (file, library) in self.private.drain(..).rev() {
            if let Err(e) = library.close() {
                tracing::debug!("Closing private dependency {:?} failed: {}", file, e);
            }
        }

        if let Some(shadow) = self.shadow.take() {
            shadow.release();
        }

        tracing::debug!("Module {} reclaimed", self.name);
    }
}

/// Keeps a module's libraries loaded. Empty for in-process modules.
#[derive(Clone, Default)]
pub struct ModuleLease {
    module: Option<Arc<LoadedModule>>,
}

impl ModuleLease {
    pub(crate) fn new(module: Option<Arc<LoadedModule>>) -> Self {
        Self { module }
    }

    /// Whether this lease pins a loaded library.
    pub fn is_pinned(&self) -> bool {
        self.module.is_some()
    }
}

impl std::fmt::Debug for ModuleLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLease")
            .field("module", &self.module.as_ref().map(|m| m.name.as_str()))
            .finish()
    }
}

/// A value built from module code, dropped before its lease.
pub struct Leased<T> {
    value: T,
    _lease: ModuleLease,
}

impl<T> Leased<T> {
    pub fn new(value: T, lease: ModuleLease) -> Self {
        Self {
            value,
            _lease: lease,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// Future produced by module code.
///
/// Panics are caught and errors are re-created as host-owned values before
/// they leave the future, so nothing that outlives the operation refers to
/// the module's code.
pub struct ModuleFuture {
    future: Option<BoxFuture<'static, anyhow::Result<()>>>,
    _lease: ModuleLease,
}

impl ModuleFuture {
    pub fn new(future: BoxFuture<'static, anyhow::Result<()>>, lease: ModuleLease) -> Self {
        Self {
            future: Some(future),
            _lease: lease,
        }
    }
}

pub(crate) fn detach_error(error: anyhow::Error) -> anyhow::Error {
    if error.downcast_ref::<OperationCancelled>().is_some() {
        anyhow::Error::new(OperationCancelled)
    } else {
        anyhow::anyhow!("{:#}", error)
    }
}

impl Future for ModuleFuture {
    type Output = anyhow::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(future) = self.future.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let polled = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx)));
        let output = match polled {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(Ok(()))) => Ok(()),
            Ok(Poll::Ready(Err(e))) => Err(detach_error(e)),
            Err(payload) => Err(anyhow::anyhow!(
                "panicked: {}",
                panic_message(payload.as_ref())
            )),
        };

        self.future = None;
        Poll::Ready(output)
    }
}
