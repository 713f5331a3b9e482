//! Program contract implemented by submodules.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::command::SubmoduleCommands;
use crate::context::{ExecutionContext, OperationCancelled};
use crate::error::Result;
use crate::events::{ChatWaiter, SubmoduleEvents};
use crate::host::HostHandle;
use crate::loader::{ModuleLease, ModuleScope};

/// A submodule program.
///
/// Programs are created through a zero-argument constructor exported from
/// the submodule library (see [`declare_programs!`](crate::declare_programs)).
/// The returned future runs on the execution context; every poll happens on
/// the host thread, so it may call the host surface directly.
///
/// Returning `Err(OperationCancelled.into())` marks the operation cancelled
/// rather than faulted.
pub trait Program: Send + 'static {
    fn run(
        &mut self,
        args: Vec<String>,
        deps: Dependencies,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<()>>;

    /// Called once when the program is stopped, after its operation was
    /// cancelled and dropped.
    fn dispose(&mut self) {}
}

/// Services handed to a running program.
#[derive(Clone)]
pub struct Dependencies {
    submodule: String,
    commands: SubmoduleCommands,
    host: HostHandle,
    context: ExecutionContext,
    events: SubmoduleEvents,
    scope: ModuleScope,
}

impl Dependencies {
    pub fn new(
        submodule: &str,
        commands: SubmoduleCommands,
        host: HostHandle,
        context: ExecutionContext,
        events: SubmoduleEvents,
    ) -> Self {
        Self {
            submodule: submodule.to_string(),
            commands,
            host,
            scope: ModuleScope::capture(context.clone()),
            context,
            events,
        }
    }

    /// Name of the submodule these dependencies belong to.
    pub fn submodule(&self) -> &str {
        &self.submodule
    }

    pub fn commands(&self) -> &SubmoduleCommands {
        &self.commands
    }

    pub fn host(&self) -> &HostHandle {
        &self.host
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn events(&self) -> &SubmoduleEvents {
        &self.events
    }

    /// Scope the program's code runs in; see [`ModuleScope`].
    pub fn scope(&self) -> &ModuleScope {
        &self.scope
    }

    pub fn chat(&self) -> Result<ChatWaiter> {
        self.events.chat()
    }

    /// Sleep unless `cancel` fires first. The timer runs on the context's runtime.
    pub async fn delay(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), OperationCancelled> {
        crate::context::sleep_or_cancel(self.context.sleep(duration), cancel).await
    }

    pub(crate) fn bind_module(&self, lease: ModuleLease) {
        self.commands.bind_module(lease);
    }

    /// Remove the submodule's commands and close its event subscriptions.
    pub fn dispose(&self) {
        self.commands.dispose();
        self.events.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.commands.is_disposed() && self.events.is_disposed()
    }
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("submodule", &self.submodule)
            .field("commands", &self.commands)
            .finish()
    }
}
