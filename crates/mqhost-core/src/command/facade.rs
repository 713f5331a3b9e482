//! Per-submodule view of the command registry.
//!
//! [`SubmoduleCommands`] is split in two halves. The generic methods run in
//! the caller's copy of this crate and wrap handlers in the submodule's
//! [`ModuleScope`]; the group behind them is built by the host and keeps all
//! registry state on the host side.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::loader::{Leased, ModuleFuture, ModuleLease, ModuleScope, detach_error};

use super::registry::{AsyncCommandHandler, CommandHandler, RegistryInner};

/// Host half of a submodule's command group.
pub(crate) trait CommandGroup: Send + Sync {
    fn submodule(&self) -> &str;
    fn add_command(&self, name: &str, handler: CommandHandler) -> Result<()>;
    fn add_async_command(&self, name: &str, handler: AsyncCommandHandler) -> Result<()>;
    fn remove_command(&self, name: &str) -> Result<bool>;
    fn bind_module(&self, lease: ModuleLease);
    fn dispose(&self);
    fn is_disposed(&self) -> bool;
}

pub(crate) struct RegistryGroup {
    submodule: String,
    registry: Weak<RegistryInner>,
    lease: RwLock<ModuleLease>,
    disposed: AtomicBool,
}

impl RegistryGroup {
    pub(crate) fn new(submodule: &str, registry: Weak<RegistryInner>) -> Self {
        Self {
            submodule: submodule.to_string(),
            registry,
            lease: RwLock::new(ModuleLease::default()),
            disposed: AtomicBool::new(false),
        }
    }

    fn lease(&self) -> ModuleLease {
        self.lease.read().clone()
    }

    fn registry(&self) -> Result<Arc<RegistryInner>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("SubmoduleCommands"));
        }
        self.registry
            .upgrade()
            .ok_or(Error::Disposed("CommandRegistry"))
    }
}

impl CommandGroup for RegistryGroup {
    fn submodule(&self) -> &str {
        &self.submodule
    }

    fn add_command(&self, name: &str, handler: CommandHandler) -> Result<()> {
        let registry = self.registry()?;
        let handler = Leased::new(handler, self.lease());
        registry.add_command(
            &self.submodule,
            name,
            Arc::new(move |arguments: Vec<String>| (handler.get())(arguments).map_err(detach_error)),
        )
    }

    fn add_async_command(&self, name: &str, handler: AsyncCommandHandler) -> Result<()> {
        let registry = self.registry()?;
        let lease = self.lease();
        let handler = Leased::new(handler, lease.clone());
        registry.add_async_command(
            &self.submodule,
            name,
            Arc::new(
                move |arguments: Vec<String>,
                      token: CancellationToken|
                      -> BoxFuture<'static, anyhow::Result<()>> {
                    Box::pin(ModuleFuture::new((handler.get())(arguments, token), lease.clone()))
                },
            ),
        )
    }

    fn remove_command(&self, name: &str) -> Result<bool> {
        self.registry()?.try_remove_command(name, &self.submodule)
    }

    fn bind_module(&self, lease: ModuleLease) {
        *self.lease.write() = lease;
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            let removed = registry.remove_commands_for_submodule(&self.submodule);
            tracing::debug!("Removed {} commands for {}", removed, self.submodule);
        }
        *self.lease.write() = ModuleLease::default();
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Commands API handed to a program through its dependencies.
///
/// Every command added here belongs to the submodule's group. Disposing the
/// facade removes the whole group and cancels the submodule's async commands.
///
/// Handlers run inside the submodule's scope; a panic in one is reported as
/// the command's error. Once the submodule's module is loaded, handlers and
/// the futures they return hold a lease on it.
#[derive(Clone)]
pub struct SubmoduleCommands {
    group: Arc<dyn CommandGroup>,
    scope: ModuleScope,
}

impl SubmoduleCommands {
    pub(crate) fn new(group: Arc<dyn CommandGroup>, scope: ModuleScope) -> Self {
        Self { group, scope }
    }

    pub(crate) fn bind_module(&self, lease: ModuleLease) {
        self.group.bind_module(lease);
    }

    pub fn submodule(&self) -> &str {
        self.group.submodule()
    }

    pub fn add_command<H>(&self, name: &str, handler: H) -> Result<()>
    where
        H: Fn(Vec<String>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let scope = self.scope.clone();
        let what = format!("command {}", name);
        self.group.add_command(
            name,
            Arc::new(move |arguments: Vec<String>| scope.call(&what, || handler(arguments))),
        )
    }

    pub fn add_async_command<H, F>(&self, name: &str, handler: H) -> Result<()>
    where
        H: Fn(Vec<String>, CancellationToken) -> F + Send + Sync + 'static,
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let scope = self.scope.clone();
        let what = format!("command {}", name);
        self.group.add_async_command(
            name,
            Arc::new(
                move |arguments: Vec<String>,
                      token: CancellationToken|
                      -> BoxFuture<'static, anyhow::Result<()>> {
                    match scope.call(&what, || Ok(handler(arguments, token).boxed())) {
                        Ok(future) => scope.guard(future),
                        Err(e) => futures::future::ready(Err(e)).boxed(),
                    }
                },
            ),
        )
    }

    pub fn remove_command(&self, name: &str) -> Result<bool> {
        self.group.remove_command(name)
    }

    /// Remove every command of this submodule and drop its module lease.
    /// Later calls are no-ops.
    pub fn dispose(&self) {
        self.group.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.group.is_disposed()
    }
}

impl std::fmt::Debug for SubmoduleCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmoduleCommands")
            .field("submodule", &self.submodule())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
