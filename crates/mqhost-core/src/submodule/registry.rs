//! Running submodules keyed by name.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::cleanup::Teardown;
use crate::config::StopConfig;
use crate::context::{ExecutionContext, TaskHandle, TaskStatus};
use crate::error::{Error, Result};
use crate::host::{HostHandle, MessageSource};
use crate::loader::{LoadRequest, ModuleLoader};
use crate::paths::HostDirs;
use crate::program::Dependencies;

use super::entry::{SubmoduleEntry, SubmoduleInfo};

struct RegistryInner {
    context: ExecutionContext,
    host: HostHandle,
    dirs: HostDirs,
    loader: Arc<dyn ModuleLoader>,
    stop: StopConfig,
    entries: DashMap<String, SubmoduleEntry>,
    /// Held for the check-then-register part of a start.
    start_lock: Mutex<()>,
    disposed: AtomicBool,
}

/// Owns every running submodule.
///
/// A name is started at most once at a time: `start_program` re-checks under
/// the start lock, so concurrent starts of one name succeed exactly once.
/// Stopping removes the entry atomically, so each entry is torn down exactly
/// once.
pub struct SubmoduleRegistry {
    inner: Arc<RegistryInner>,
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidName {
            kind: "submodule",
            name: name.to_string(),
        });
    }
    Ok(())
}

impl RegistryInner {
    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::Disposed("SubmoduleRegistry"))
        } else {
            Ok(())
        }
    }

    fn start_program(&self, name: &str, args: Vec<String>, deps: Dependencies) -> Result<bool> {
        self.check_disposed()?;
        validate_name(name)?;

        if self.entries.contains_key(name) {
            tracing::info!(
                "A submodule program instance is already loaded/running with the name: {}",
                name
            );
            return Ok(false);
        }

        let _guard = self.start_lock.lock();
        if self.entries.contains_key(name) {
            tracing::info!(
                "A submodule program instance is already loaded/running with the name: {}",
                name
            );
            return Ok(false);
        }

        let request = LoadRequest::for_program(&self.dirs, name);
        if !request.module_path.is_file() {
            tracing::warn!(
                "Submodule program file not found: {}",
                request.module_path.display()
            );
            return Ok(false);
        }

        let mut entry = SubmoduleEntry::new(name);
        if let Err(e) = self.populate(&mut entry, &request, args, deps) {
            tracing::error!("Failed to start submodule program {}: {}", name, e);
            entry.teardown(Teardown::Logged);
            return if e.is_programmer_error() {
                Err(e)
            } else {
                Ok(false)
            };
        }

        tracing::info!(
            "Started submodule program {} ({})",
            name,
            entry.program_type
        );
        self.entries.insert(name.to_string(), entry);
        Ok(true)
    }

    /// Load, construct and start; each created resource is recorded in
    /// `entry` before the next step so a failure can unwind it.
    fn populate(
        &self,
        entry: &mut SubmoduleEntry,
        request: &LoadRequest,
        args: Vec<String>,
        deps: Dependencies,
    ) -> Result<()> {
        entry.deps = Some(deps.clone());

        let domain = entry.domain.insert(self.loader.load(request)?);
        let program_type = domain.select_program(&entry.name)?;
        let lease = domain.lease();
        entry.program_type = program_type.type_name().to_string();
        let instance = entry.instance.insert(program_type.instantiate(lease.clone())?);

        deps.bind_module(lease);
        let future = instance.run(args, deps, entry.cancel.clone())?;
        entry.task = Some(self.context.spawn(
            format!("program {}", entry.name),
            future,
            Some(entry.cancel.clone()),
        ));
        Ok(())
    }

    fn stop_program(&self, name: &str) -> Result<bool> {
        self.check_disposed()?;
        validate_name(name)?;

        let Some((_, mut entry)) = self.entries.remove(name) else {
            tracing::info!(
                "A submodule program instance is not currently loaded/running with the name: {}",
                name
            );
            return Ok(false);
        };

        tracing::info!("Stopping submodule program: {}", name);
        entry.teardown(Teardown::Logged);
        Ok(true)
    }

    /// Tear down the instance started as `id`, unless it already stopped or
    /// was replaced by a restart.
    fn stop_program_instance(&self, name: &str, id: Uuid) -> Result<bool> {
        self.check_disposed()?;

        let Some((_, mut entry)) = self.entries.remove_if(name, |_, e| e.id == id) else {
            tracing::info!(
                "Submodule program {} already stopped (start {})",
                name,
                id
            );
            return Ok(false);
        };

        tracing::info!("Stopping submodule program: {}", name);
        entry.teardown(Teardown::Logged);
        Ok(true)
    }

    /// Remove and tear down every entry whose operation finished.
    fn sweep(&self) -> usize {
        let finished: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_terminal())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for name in finished {
            let Some((_, mut entry)) = self.entries.remove_if(&name, |_, e| e.is_terminal()) else {
                continue;
            };

            let status = entry.status();
            match entry.report_fault() {
                Some(message) => self.host.error(
                    MessageSource::Program,
                    &format!("{} failed: {}", name, message),
                ),
                None => tracing::info!("Program {} finished with status {}", name, status),
            }

            entry.teardown(Teardown::Logged);
            removed += 1;
        }
        removed
    }

    fn teardown(&self, mode: Teardown) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, mut entry)) = self.entries.remove(&name) {
                entry.teardown(mode);
            }
        }

        if mode == Teardown::Logged {
            tracing::info!("Submodule registry disposed");
        }
    }
}

/// Result of a bounded stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// Last status of the operation observed before the stop.
    pub status: TaskStatus,
    /// Whether this stop tore the instance down. `false` if it had already
    /// been stopped, swept, or replaced by a restart.
    pub stopped: bool,
}

/// The started instance whose cancellation was requested.
struct StopTicket {
    id: Uuid,
    task: Option<TaskHandle>,
}

async fn wait_for_stop(
    registry: Weak<RegistryInner>,
    name: String,
    stop: StopConfig,
    ticket: StopTicket,
) -> Result<Option<StopOutcome>> {
    let task = ticket.task;
    let status = || {
        task.as_ref()
            .map(|t| t.status())
            .unwrap_or(TaskStatus::Completed)
    };

    tokio::time::sleep(stop.first_grace()).await;
    tracing::debug!("{} status after first grace period: {}", name, status());

    if !status().is_terminal() {
        tokio::time::sleep(stop.second_grace()).await;
        tracing::debug!("{} status after second grace period: {}", name, status());
    }

    let last = status();
    let registry = registry
        .upgrade()
        .ok_or(Error::Disposed("SubmoduleRegistry"))?;
    let stopped = registry.stop_program_instance(&name, ticket.id)?;

    if stopped {
        tracing::debug!("Done stopping program: {}", name);
        registry
            .host
            .info(MessageSource::General, &format!("Done stopping program: {}", name));
    }
    Ok(Some(StopOutcome {
        status: last,
        stopped,
    }))
}

impl SubmoduleRegistry {
    pub fn new(
        context: ExecutionContext,
        host: HostHandle,
        dirs: HostDirs,
        loader: Arc<dyn ModuleLoader>,
        stop: StopConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                context,
                host,
                dirs,
                loader,
                stop,
                entries: DashMap::new(),
                start_lock: Mutex::new(()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Start `<programs>/<name>/<name>.<ext>`.
    ///
    /// Returns `Ok(false)` if the program is already running, its file is
    /// missing, or loading failed; `Err` for programmer errors (empty name,
    /// no program type, no constructor). Once loading begins, `deps` belong
    /// to the program and are disposed when it stops or its load fails; an
    /// already-running or missing program leaves them untouched.
    pub fn start_program(&self, name: &str, args: Vec<String>, deps: Dependencies) -> Result<bool> {
        self.inner.start_program(name, args, deps)
    }

    /// Tear down a running program right away.
    pub fn stop_program(&self, name: &str) -> Result<bool> {
        self.inner.stop_program(name)
    }

    /// Request cancellation, give the program two grace periods to finish,
    /// then stop it regardless.
    ///
    /// Only the instance running when this is called is stopped; if it went
    /// away in the meantime, a program restarted under the same name keeps
    /// running and the outcome reports `stopped: false`. Resolves to `None`
    /// if no such program is running.
    pub fn try_stop_program(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<StopOutcome>>> + Send + use<> {
        let prepared = self.prepare_stop(name);
        let registry = Arc::downgrade(&self.inner);
        let stop = self.inner.stop;
        let name = name.to_string();

        async move {
            match prepared? {
                Some(ticket) => wait_for_stop(registry, name, stop, ticket).await,
                None => Ok(None),
            }
        }
    }

    fn prepare_stop(&self, name: &str) -> Result<Option<StopTicket>> {
        self.inner.check_disposed()?;
        match self.inner.entries.get(name) {
            Some(entry) => {
                entry.request_cancel();
                Ok(Some(StopTicket {
                    id: entry.id,
                    task: entry.task.clone(),
                }))
            }
            None => {
                tracing::warn!("Failed to find submodule program: {}", name);
                Ok(None)
            }
        }
    }

    /// Stop every running program. Returns `Ok(true)` if all stopped.
    pub fn stop_all_programs(&self) -> Result<bool> {
        self.inner.check_disposed()?;
        tracing::info!("Stopping all submodule programs...");

        let names = self.running_program_names();
        let mut all_stopped = true;
        for name in names {
            all_stopped &= self.inner.stop_program(&name)?;
        }
        Ok(all_stopped)
    }

    /// Remove every program whose operation has finished.
    pub fn process_running_program_tasks(&self) -> usize {
        if self.inner.check_disposed().is_err() {
            return 0;
        }
        self.inner.sweep()
    }

    /// Call `f` with a snapshot of each running program, reclaiming finished ones first.
    pub fn execute_for_each_submodule(&self, mut f: impl FnMut(&SubmoduleInfo)) -> Result<()> {
        self.inner.check_disposed()?;
        self.inner.sweep();

        let infos: Vec<SubmoduleInfo> = self.inner.entries.iter().map(|e| e.info()).collect();
        for info in &infos {
            f(info);
        }
        Ok(())
    }

    /// Write one line per running program to the host.
    pub fn print_running_programs(&self) -> Result<()> {
        let host = self.inner.host.clone();
        let mut count = 0;
        self.execute_for_each_submodule(|info| {
            count += 1;
            let line = format!(
                "{} is currently running. [Elapsed Time: {} ms]",
                info.name,
                info.started_at.elapsed().as_millis()
            );
            tracing::debug!("{}", line);
            host.info(MessageSource::General, &line);
        })?;

        if count == 0 {
            host.info(MessageSource::General, "No programs are running.");
        }
        Ok(())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.inner.entries.contains_key(name)
    }

    pub fn running_program_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Stop every program. Later operations fail with [`Error::Disposed`].
    pub fn dispose(&self) {
        self.inner.teardown(Teardown::Logged);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl Drop for SubmoduleRegistry {
    fn drop(&mut self) {
        self.inner.teardown(Teardown::Silent);
    }
}

impl std::fmt::Debug for SubmoduleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmoduleRegistry")
            .field("running", &self.running_program_names())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
