//! Command table shared by every submodule.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::cleanup::{Teardown, guarded, guarded_infallible, panic_message};
use crate::context::{ExecutionContext, TaskHandle, TaskStatus};
use crate::error::{Error, Result};
use crate::host::{HostHandle, MessageSource};
use crate::loader::ModuleScope;

use super::args::split_arguments;
use super::facade::{RegistryGroup, SubmoduleCommands};

/// Synchronous command handler.
pub type CommandHandler = Arc<dyn Fn(Vec<String>) -> anyhow::Result<()> + Send + Sync + 'static>;

/// Asynchronous command handler: returns the operation to run on the context.
pub type AsyncCommandHandler = Arc<
    dyn Fn(Vec<String>, CancellationToken) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync
        + 'static,
>;

/// What the host's dispatch calls with the raw argument buffer.
type Trampoline = Arc<dyn Fn(&str) + Send + Sync + 'static>;

struct CommandEntry {
    submodule: String,
    trampoline: Trampoline,
}

/// One invocation of an async command.
pub struct AsyncCommandTask {
    command_name: String,
    started_at: Instant,
    task: TaskHandle,
    cancel: CancellationToken,
}

impl AsyncCommandTask {
    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub(crate) fn box_async_handler<H, F>(handler: H) -> AsyncCommandHandler
where
    H: Fn(Vec<String>, CancellationToken) -> F + Send + Sync + 'static,
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(
        move |arguments: Vec<String>,
              token: CancellationToken|
              -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(handler(arguments, token))
        },
    )
}

/// Prefix `name` with `/` if it is missing.
pub fn normalize_command_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

pub(crate) struct RegistryInner {
    context: ExecutionContext,
    host: HostHandle,
    commands: DashMap<String, CommandEntry>,
    groups: DashMap<String, Vec<String>>,
    submodule_tokens: DashMap<String, CancellationToken>,
    async_tasks: DashMap<String, Vec<AsyncCommandTask>>,
    sync_in_progress: DashMap<String, Instant>,
    disposed: AtomicBool,
}

/// Clears the in-progress marker of a synchronous command on every exit path.
struct InProgressMarker<'a> {
    map: &'a DashMap<String, Instant>,
    name: &'a str,
}

impl Drop for InProgressMarker<'_> {
    fn drop(&mut self) {
        match self.map.remove(self.name) {
            Some((_, started)) => tracing::info!(
                "Synchronous command {} stopped [Elapsed: {} ms]",
                self.name,
                started.elapsed().as_millis()
            ),
            None => tracing::warn!(
                "Synchronous command {} stopped [No start time available]",
                self.name
            ),
        }
    }
}

fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// The `/`-prefixed form every command is stored and registered under.
fn command_key(name: &str) -> Result<String> {
    validate_name("command", name)?;
    let key = normalize_command_name(name.trim());
    if key == "/" || key.chars().any(char::is_whitespace) {
        return Err(Error::InvalidName {
            kind: "command",
            name: name.to_string(),
        });
    }
    Ok(key)
}

impl RegistryInner {
    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::Disposed("CommandRegistry"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn add_command(
        self: &Arc<Self>,
        submodule: &str,
        name: &str,
        handler: CommandHandler,
    ) -> Result<()> {
        self.check_disposed()?;
        validate_name("submodule", submodule)?;
        let name = command_key(name)?;
        tracing::info!("Attempting to register (synchronous) command: {}", name);

        let weak = Arc::downgrade(self);
        let command_name = name.clone();
        let trampoline: Trampoline = Arc::new(move |raw: &str| {
            let Some(registry) = weak.upgrade() else {
                return;
            };
            tracing::info!(
                "Executing (synchronous) command ({}) with arguments: {}",
                command_name,
                raw
            );
            let arguments = split_arguments(raw);
            registry
                .context
                .run_with_context(|| registry.run_sync(&command_name, &handler, arguments));
        });

        self.register(submodule, &name, trampoline)
    }

    pub(crate) fn add_async_command(
        self: &Arc<Self>,
        submodule: &str,
        name: &str,
        handler: AsyncCommandHandler,
    ) -> Result<()> {
        self.check_disposed()?;
        validate_name("submodule", submodule)?;
        let name = command_key(name)?;
        tracing::info!("Attempting to register (asynchronous) command: {}", name);

        let weak = Arc::downgrade(self);
        let command_name = name.clone();
        let owner = submodule.to_string();
        let trampoline: Trampoline = Arc::new(move |raw: &str| {
            let Some(registry) = weak.upgrade() else {
                return;
            };
            tracing::info!(
                "Executing (asynchronous) command ({}) with arguments: {}",
                command_name,
                raw
            );
            let arguments = split_arguments(raw);
            registry.context.run_with_context(|| {
                registry.start_async(&owner, &command_name, &handler, arguments)
            });
        });

        self.register(submodule, &name, trampoline)
    }

    fn register(&self, submodule: &str, name: &str, trampoline: Trampoline) -> Result<()> {
        match self.commands.entry(name.to_string()) {
            Entry::Occupied(_) => {
                tracing::warn!("A command is already registered with the name: {}", name);
                return Err(Error::DuplicateCommand(name.to_string()));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CommandEntry {
                    submodule: submodule.to_string(),
                    trampoline,
                });
            }
        }

        self.groups
            .entry(submodule.to_string())
            .or_default()
            .push(name.to_string());

        tracing::debug!("Registering command {} with the host", name);
        if let Err(e) = self.host.add_command(name) {
            self.commands.remove(name);
            self.remove_from_groups(name, submodule);
            return Err(e);
        }

        Ok(())
    }

    fn run_sync(&self, name: &str, handler: &CommandHandler, arguments: Vec<String>) {
        let already_running = match self.sync_in_progress.entry(name.to_string()) {
            Entry::Occupied(occupied) => Some(*occupied.get()),
            Entry::Vacant(vacant) => {
                vacant.insert(Instant::now());
                None
            }
        };

        if let Some(started) = already_running {
            let message = format!(
                "Command ({}) is currently in progress. Only one instance of a sync command may execute at a time. [Elapsed: {} ms]",
                name,
                started.elapsed().as_millis()
            );
            tracing::warn!("{}", message);
            self.host.error(MessageSource::General, &message);
            return;
        }

        let _marker = InProgressMarker {
            map: &self.sync_in_progress,
            name,
        };

        match catch_unwind(AssertUnwindSafe(|| handler(arguments))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Error in {}: {:#}", name, e);
                self.host
                    .error(MessageSource::General, &format!("Exception in {}: {:#}", name, e));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!("Command {} panicked: {}", name, message);
                self.host
                    .error(MessageSource::General, &format!("Exception in {}: {}", name, message));
            }
        }
    }

    fn start_async(
        &self,
        submodule: &str,
        name: &str,
        handler: &AsyncCommandHandler,
        arguments: Vec<String>,
    ) {
        let token = self.submodule_token(submodule).child_token();

        let future = match catch_unwind(AssertUnwindSafe(|| handler(arguments, token.clone()))) {
            Ok(future) => future,
            Err(payload) => {
                token.cancel();
                let message = panic_message(payload.as_ref());
                tracing::error!("Async command {} panicked while starting: {}", name, message);
                self.host
                    .error(MessageSource::General, &format!("Exception in {}: {}", name, message));
                return;
            }
        };

        let task = self.context.spawn(name, future, Some(token.clone()));
        self.async_tasks
            .entry(submodule.to_string())
            .or_default()
            .push(AsyncCommandTask {
                command_name: name.to_string(),
                started_at: Instant::now(),
                task,
                cancel: token,
            });
    }

    fn submodule_token(&self, submodule: &str) -> CancellationToken {
        self.submodule_tokens
            .entry(submodule.to_string())
            .or_default()
            .clone()
    }

    pub(crate) fn invoke(&self, name: &str, raw: &str) -> Result<bool> {
        self.check_disposed()?;

        // Clone the trampoline out so the handler can touch the table.
        let trampoline = match self.commands.get(&normalize_command_name(name)) {
            Some(entry) => Arc::clone(&entry.trampoline),
            None => {
                tracing::debug!("No command registered for {}", name);
                return Ok(false);
            }
        };

        trampoline(raw);
        Ok(true)
    }

    fn cancel_matching(&self, matches: impl Fn(&AsyncCommandTask) -> bool) -> usize {
        let tokens: Vec<CancellationToken> = self
            .async_tasks
            .iter()
            .flat_map(|list| {
                list.value()
                    .iter()
                    .filter(|task| matches(task))
                    .map(|task| task.cancel.clone())
                    .collect::<Vec<_>>()
            })
            .collect();

        for token in &tokens {
            token.cancel();
        }

        if !tokens.is_empty() {
            // Give the cancelled operations a chance to observe it.
            guarded_infallible("pump", "cancelled commands", Teardown::Logged, || {
                self.context.pump(true);
            });
        }

        tokens.len()
    }

    pub(crate) fn cancel_async_command_task(&self, name: &str) -> usize {
        let normalized = normalize_command_name(name);
        tracing::debug!(
            "Attempting to cancel async command task(s) for command name: {}",
            normalized
        );
        self.cancel_matching(|task| task.command_name == normalized)
    }

    pub(crate) fn cancel_all_async_command_tasks(&self) -> usize {
        tracing::debug!("Attempting to cancel all async command tasks");
        self.cancel_matching(|_| true)
    }

    pub(crate) fn remove_commands_for_submodule(&self, submodule: &str) -> usize {
        if let Some((_, token)) = self.submodule_tokens.remove(submodule) {
            tracing::info!("Cancelling all submodule async command tasks for: {}", submodule);
            token.cancel();
        }

        let Some((_, names)) = self.groups.remove(submodule) else {
            tracing::debug!("No commands registered for submodule: {}", submodule);
            return 0;
        };

        let mut removed = 0;
        for name in names {
            match self.remove_entry(&name) {
                Ok(_) => removed += 1,
                Err(e) => tracing::error!(
                    "Failed to unregister the command ({}) for submodule {}: {}",
                    name,
                    submodule,
                    e
                ),
            }
        }
        removed
    }

    pub(crate) fn try_remove_command(&self, name: &str, submodule: &str) -> Result<bool> {
        self.check_disposed()?;
        let name = normalize_command_name(name);
        tracing::info!("Attempting to unregister command with name: {}", name);

        if !self.commands.contains_key(&name) {
            return Ok(false);
        }
        if !self.remove_from_groups(&name, submodule) {
            tracing::warn!("Command {} was not in the group of {}", name, submodule);
        }
        self.remove_entry(&name)
    }

    /// Remove the table entry and unregister it from the host.
    fn remove_entry(&self, name: &str) -> Result<bool> {
        if self.commands.remove(name).is_none() {
            return Ok(false);
        }
        self.host.remove_command(name)?;
        Ok(true)
    }

    fn remove_from_groups(&self, name: &str, submodule: &str) -> bool {
        let mut removed_from_owner = false;
        for mut group in self.groups.iter_mut() {
            let before = group.len();
            group.retain(|n| n != name);
            if group.len() == before {
                continue;
            }
            if group.key() == submodule {
                removed_from_owner = true;
            } else {
                tracing::warn!(
                    "Command {} was removed from a different submodule than expected [Expected: {}] [Actual: {}]",
                    name,
                    submodule,
                    group.key()
                );
            }
        }
        removed_from_owner
    }

    pub(crate) fn process_async_command_tasks(&self) -> usize {
        let mut removed = 0;
        for mut list in self.async_tasks.iter_mut() {
            let submodule = list.key().clone();
            list.value_mut().retain(|task| {
                let status = task.status();
                if !status.is_terminal() {
                    return true;
                }
                tracing::debug!(
                    "Removing async command task {} for {} [Status: {}] [Elapsed: {} ms]",
                    task.command_name,
                    submodule,
                    status,
                    task.started_at.elapsed().as_millis()
                );
                removed += 1;
                false
            });
        }
        self.async_tasks.retain(|_, list| !list.is_empty());
        removed
    }

    pub(crate) fn print_registered_commands(&self) -> Result<()> {
        self.check_disposed()?;

        let mut all: Vec<String> = self.commands.iter().map(|e| e.key().clone()).collect();
        all.sort();
        tracing::info!("All registered commands: {}", all.join(", "));
        self.host.info(
            MessageSource::General,
            &format!("Registered commands: {}", all.join(", ")),
        );

        let mut groups: Vec<(String, Vec<String>)> = self
            .groups
            .iter()
            .map(|g| (g.key().clone(), g.value().clone()))
            .collect();
        groups.sort();
        for (submodule, names) in groups {
            let line = format!("  {}: {}", submodule, names.join(", "));
            tracing::info!("{}", line);
            self.host.write_line(&line);
        }
        Ok(())
    }

    pub(crate) fn print_running_commands(&self) -> Result<()> {
        self.check_disposed()?;

        for running in self.sync_in_progress.iter() {
            let line = format!(
                "  Synchronous command {} is running. [Elapsed: {} ms]",
                running.key(),
                running.value().elapsed().as_millis()
            );
            tracing::debug!("{}", line);
            self.host.write_line(&line);
        }

        self.process_async_command_tasks();

        let mut lines = Vec::new();
        for list in self.async_tasks.iter() {
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for task in list.value() {
                let index = counts.entry(task.command_name.as_str()).or_default();
                *index += 1;
                lines.push(format!(
                    "  Async command {} (#{}) task is in progress. [Elapsed: {} ms] [Status: {}]",
                    task.command_name,
                    index,
                    task.started_at.elapsed().as_millis(),
                    task.status()
                ));
            }
        }
        for line in lines {
            tracing::debug!("{}", line);
            self.host.write_line(&line);
        }
        Ok(())
    }

    fn teardown(&self, mode: Teardown) {
        self.disposed.store(true, Ordering::Release);

        let names: Vec<String> = self.commands.iter().map(|e| e.key().clone()).collect();
        for name in &names {
            guarded("remove command", name, mode, || self.host.remove_command(name));
        }
        self.commands.clear();

        for token in self.submodule_tokens.iter() {
            token.value().cancel();
        }
        self.submodule_tokens.clear();

        let tasks: Vec<AsyncCommandTask> = self
            .async_tasks
            .iter_mut()
            .flat_map(|mut list| std::mem::take(list.value_mut()))
            .collect();
        self.async_tasks.clear();
        for task in tasks {
            task.cancel.cancel();
            guarded_infallible("dispose task", &task.command_name, mode, || {
                task.task.dispose()
            });
        }

        self.groups.clear();
        self.sync_in_progress.clear();

        if mode == Teardown::Logged {
            tracing::info!("Command registry disposed ({} commands removed)", names.len());
        }
    }
}

/// Named textual commands exposed to the host.
///
/// Every command belongs to exactly one submodule group. Synchronous commands
/// run inline inside the execution context and are single-flight per name;
/// asynchronous commands spawn one operation per invocation, cancellable per
/// invocation or through their submodule's shared token.
pub struct CommandRegistry {
    inner: Arc<RegistryInner>,
}

impl CommandRegistry {
    pub fn new(context: ExecutionContext, host: HostHandle) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                context,
                host,
                commands: DashMap::new(),
                groups: DashMap::new(),
                submodule_tokens: DashMap::new(),
                async_tasks: DashMap::new(),
                sync_in_progress: DashMap::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a synchronous command owned by `submodule`.
    ///
    /// `name` is stored, registered with the host and matched in its
    /// `/`-prefixed form, so `wait` and `/wait` name the same command.
    ///
    /// # Errors
    /// [`Error::DuplicateCommand`] if `name` is already registered; the
    /// existing registration stays active.
    pub fn add_command<H>(&self, submodule: &str, name: &str, handler: H) -> Result<()>
    where
        H: Fn(Vec<String>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.add_command(submodule, name, Arc::new(handler))
    }

    /// Register an asynchronous command owned by `submodule`.
    pub fn add_async_command<H, F>(&self, submodule: &str, name: &str, handler: H) -> Result<()>
    where
        H: Fn(Vec<String>, CancellationToken) -> F + Send + Sync + 'static,
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .add_async_command(submodule, name, box_async_handler(handler))
    }

    /// Dispatch a command the host received. Returns `Ok(false)` for unknown names.
    pub fn invoke(&self, name: &str, raw_arguments: &str) -> Result<bool> {
        self.inner.invoke(name, raw_arguments)
    }

    /// Cancel every in-flight invocation of `name` (with or without the leading `/`).
    pub fn cancel_async_command_task(&self, name: &str) -> usize {
        self.inner.cancel_async_command_task(name)
    }

    pub fn cancel_all_async_command_tasks(&self) -> usize {
        self.inner.cancel_all_async_command_tasks()
    }

    /// Cancel the submodule's shared token and unregister its whole group.
    pub fn remove_commands_for_submodule(&self, submodule: &str) -> usize {
        self.inner.remove_commands_for_submodule(submodule)
    }

    pub fn try_remove_command(&self, name: &str, submodule: &str) -> Result<bool> {
        self.inner.try_remove_command(name, submodule)
    }

    /// Drop finished async invocations. Returns how many were removed.
    pub fn process_async_command_tasks(&self) -> usize {
        self.inner.process_async_command_tasks()
    }

    pub fn print_registered_commands(&self) -> Result<()> {
        self.inner.print_registered_commands()
    }

    pub fn print_running_commands(&self) -> Result<()> {
        self.inner.print_running_commands()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner
            .commands
            .contains_key(&normalize_command_name(name))
    }

    /// Owner of a registered command.
    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.inner
            .commands
            .get(&normalize_command_name(name))
            .map(|e| e.submodule.clone())
    }

    /// Names registered by `submodule`.
    pub fn commands_for_submodule(&self, submodule: &str) -> Vec<String> {
        self.inner
            .groups
            .get(submodule)
            .map(|g| g.value().clone())
            .unwrap_or_default()
    }

    /// Number of tracked async invocations, finished or not.
    pub fn async_task_count(&self) -> usize {
        self.inner.async_tasks.iter().map(|l| l.value().len()).sum()
    }

    /// Command facade handed to one submodule.
    pub fn for_submodule(&self, submodule: &str) -> SubmoduleCommands {
        SubmoduleCommands::new(
            Arc::new(RegistryGroup::new(submodule, self.downgrade())),
            ModuleScope::capture(self.inner.context.clone()),
        )
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    /// Unregister every command, cancel every token and drop every task.
    pub fn dispose(&self) {
        if self.inner.disposed.load(Ordering::Acquire) {
            return;
        }
        self.inner.teardown(Teardown::Logged);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl Drop for CommandRegistry {
    fn drop(&mut self) {
        if !self.inner.disposed.load(Ordering::Acquire) {
            self.inner.teardown(Teardown::Silent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingHost;
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    fn registry() -> (CommandRegistry, Arc<RecordingHost>, ExecutionContext) {
        let host = RecordingHost::new();
        let context = ExecutionContext::new();
        let registry = CommandRegistry::new(context.clone(), HostHandle::new(host.clone()));
        (registry, host, context)
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let (registry, host, _ctx) = registry();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&calls);
        registry
            .add_command("A", "/x", move |_| {
                first.lock().push("A");
                Ok(())
            })
            .unwrap();

        let second = Arc::clone(&calls);
        let result = registry.add_command("B", "/x", move |_| {
            second.lock().push("B");
            Ok(())
        });
        assert!(matches!(result, Err(Error::DuplicateCommand(_))));

        assert!(registry.invoke("/x", "").unwrap());
        assert_eq!(*calls.lock(), vec!["A"]);
        assert_eq!(registry.owner_of("/x").as_deref(), Some("A"));
        assert_eq!(host.registered_commands(), vec!["/x".to_string()]);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (registry, _host, _ctx) = registry();
        assert!(matches!(
            registry.add_command(" ", "/x", |_| Ok(())),
            Err(Error::InvalidName { kind: "submodule", .. })
        ));
        assert!(matches!(
            registry.add_command("A", "", |_| Ok(())),
            Err(Error::InvalidName { kind: "command", .. })
        ));
    }

    #[test]
    fn test_unknown_command() {
        let (registry, _host, _ctx) = registry();
        assert!(!registry.invoke("/missing", "a b").unwrap());
    }

    #[test]
    fn test_sync_command_receives_split_arguments_inside_context() {
        let (registry, _host, ctx) = registry();
        let seen = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&seen);
        let check = ctx.clone();
        registry
            .add_command("A", "/echo", move |args| {
                *slot.lock() = Some((args, check.is_current()));
                Ok(())
            })
            .unwrap();

        registry.invoke("/echo", r#"one "two three""#).unwrap();
        let (args, in_context) = seen.lock().take().unwrap();
        assert_eq!(args, vec!["one", "two three"]);
        assert!(in_context);
    }

    #[test]
    fn test_sync_command_is_single_flight() {
        let (registry, host, _ctx) = registry();
        let registry = Arc::new(registry);
        let runs = Arc::new(AtomicUsize::new(0));

        let inner_registry = Arc::downgrade(&registry);
        let counter = Arc::clone(&runs);
        registry
            .add_command("A", "/slow", move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                // Re-enter the same command while it is in progress.
                if args.is_empty() {
                    if let Some(registry) = inner_registry.upgrade() {
                        registry.invoke("/slow", "nested")?;
                    }
                }
                Ok(())
            })
            .unwrap();

        registry.invoke("/slow", "").unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(host.saw("is currently in progress"));

        // The marker was cleared: the next invocation runs.
        host.clear_lines();
        registry.invoke("/slow", "again").unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!host.saw("in progress"));
    }

    #[test]
    fn test_failing_handler_clears_marker() {
        let (registry, host, _ctx) = registry();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        registry
            .add_command("A", "/fail", move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    anyhow::bail!("first call fails");
                }
                panic!("second call panics");
            })
            .unwrap();

        registry.invoke("/fail", "").unwrap();
        assert!(host.saw("first call fails"));
        registry.invoke("/fail", "").unwrap();
        assert!(host.saw("second call panics"));
        registry.invoke("/fail", "").unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_async_invocations_coexist_and_cancel_by_name() {
        let (registry, _host, ctx) = registry();

        registry
            .add_async_command("A", "/wait", |_args, token: CancellationToken| async move {
                token.cancelled().await;
                Err(anyhow::Error::new(crate::context::OperationCancelled))
            })
            .unwrap();

        registry.invoke("/wait", "").unwrap();
        registry.invoke("/wait", "").unwrap();
        ctx.pump(true);
        assert_eq!(registry.async_task_count(), 2);
        assert_eq!(registry.process_async_command_tasks(), 0);

        assert_eq!(registry.cancel_async_command_task("wait"), 2);
        ctx.pump(true);
        assert_eq!(registry.process_async_command_tasks(), 2);
        assert_eq!(registry.async_task_count(), 0);
    }

    #[test]
    fn test_unprefixed_name_is_stored_prefixed() {
        let (registry, host, ctx) = registry();

        registry
            .add_async_command("A", "wait", |_args, token: CancellationToken| async move {
                token.cancelled().await;
                Err(anyhow::Error::new(crate::context::OperationCancelled))
            })
            .unwrap();
        assert_eq!(host.registered_commands(), vec!["/wait".to_string()]);
        assert_eq!(registry.commands_for_submodule("A"), vec!["/wait".to_string()]);
        assert!(matches!(
            registry.add_command("B", "/wait", |_| Ok(())),
            Err(Error::DuplicateCommand(_))
        ));

        registry.invoke("/wait", "").unwrap();
        registry.invoke("wait", "").unwrap();
        ctx.pump(true);
        assert_eq!(registry.async_task_count(), 2);

        assert_eq!(registry.cancel_async_command_task("wait"), 2);
        ctx.pump(true);
        assert_eq!(registry.process_async_command_tasks(), 2);

        assert!(registry.try_remove_command("wait", "A").unwrap());
        assert!(host.registered_commands().is_empty());
    }

    #[test]
    fn test_bare_slash_rejected() {
        let (registry, _host, _ctx) = registry();
        assert!(matches!(
            registry.add_command("A", "/", |_| Ok(())),
            Err(Error::InvalidName { kind: "command", .. })
        ));
        assert!(matches!(
            registry.add_command("A", "/two words", |_| Ok(())),
            Err(Error::InvalidName { kind: "command", .. })
        ));
    }

    #[test]
    fn test_remove_commands_for_submodule_cascades() {
        let (registry, host, ctx) = registry();

        registry.add_command("A", "/a1", |_| Ok(())).unwrap();
        registry
            .add_async_command("A", "/a2", |_args, token: CancellationToken| async move {
                token.cancelled().await;
                Ok(())
            })
            .unwrap();
        registry.add_command("B", "/b1", |_| Ok(())).unwrap();

        registry.invoke("/a2", "").unwrap();
        ctx.pump(true);

        assert_eq!(registry.remove_commands_for_submodule("A"), 2);
        assert!(!registry.is_registered("/a1"));
        assert!(!registry.is_registered("/a2"));
        assert!(registry.is_registered("/b1"));
        assert_eq!(host.registered_commands(), vec!["/b1".to_string()]);

        // The shared token was cancelled, so the invocation finishes.
        ctx.pump(true);
        assert_eq!(registry.process_async_command_tasks(), 1);
        assert_eq!(registry.remove_commands_for_submodule("A"), 0);
    }

    #[test]
    fn test_remove_tolerates_host_failure() {
        let (registry, host, _ctx) = registry();
        registry.add_command("A", "/a1", |_| Ok(())).unwrap();
        registry.add_command("A", "/a2", |_| Ok(())).unwrap();
        host.fail_remove_of("/a1");

        assert_eq!(registry.remove_commands_for_submodule("A"), 1);
        assert!(!registry.is_registered("/a1"));
        assert!(!registry.is_registered("/a2"));
    }

    #[test]
    fn test_try_remove_command() {
        let (registry, _host, _ctx) = registry();
        registry.add_command("A", "/a1", |_| Ok(())).unwrap();

        assert!(registry.try_remove_command("/a1", "A").unwrap());
        assert!(!registry.try_remove_command("/a1", "A").unwrap());
        assert!(registry.commands_for_submodule("A").is_empty());
    }

    #[test]
    fn test_dispose_unregisters_everything() {
        let (registry, host, _ctx) = registry();
        registry.add_command("A", "/a1", |_| Ok(())).unwrap();
        registry.add_command("B", "/b1", |_| Ok(())).unwrap();

        registry.dispose();
        assert!(host.registered_commands().is_empty());
        assert!(matches!(registry.invoke("/a1", ""), Err(Error::Disposed(_))));
        assert!(matches!(
            registry.add_command("A", "/a3", |_| Ok(())),
            Err(Error::Disposed(_))
        ));
    }

    #[test]
    fn test_drop_unregisters_silently() {
        let (registry, host, _ctx) = registry();
        registry.add_command("A", "/a1", |_| Ok(())).unwrap();
        drop(registry);
        assert!(host.registered_commands().is_empty());
    }

    #[test]
    fn test_print_running_commands() {
        let (registry, host, ctx) = registry();
        registry
            .add_async_command("A", "/wait", |_args, token: CancellationToken| async move {
                token.cancelled().await;
                Ok(())
            })
            .unwrap();
        registry.invoke("/wait", "").unwrap();
        ctx.pump(true);

        registry.print_running_commands().unwrap();
        assert!(host.saw("Async command /wait (#1) task is in progress"));

        registry.print_registered_commands().unwrap();
        assert!(host.saw("Registered commands: /wait"));
    }
}
