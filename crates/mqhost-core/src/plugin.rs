//! The plugin host: one of each registry, driven by host callbacks.
//!
//! ```text
//! host callback          PluginHost
//! ─────────────          ──────────
//! pulse ───────────────► pump context ──► sweep finished programs and commands
//! command ─────────────► CommandRegistry::invoke
//! zone / chat / ... ───► EventHub::publish ──► submodule subscribers
//! shutdown ────────────► dispose submodules, then commands
//! ```
//!
//! Built-in commands are registered under the [`HOST_SUBMODULE`] group:
//! `/netrun <program> [args]`, `/netend <program|*>`, `/netlist` and
//! `/netcancel <command|*>`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::runtime::{Handle, Runtime};

use crate::cleanup::panic_message;
use crate::command::CommandRegistry;
use crate::config::HostConfig;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::events::{ChatLine, ChatSource, EventHub, GameState, HostEvent};
use crate::host::{HostHandle, HostSurface, MessageSource};
use crate::loader::{DylibLoader, HOST_RUNTIME_NAME, ModuleLoader, ShadowCopies, SharedLibraries};
use crate::logging;
use crate::paths::{HostDirs, SETTINGS_FILE_NAME};
use crate::program::Dependencies;
use crate::submodule::SubmoduleRegistry;

/// Command group owning the built-in commands.
pub const HOST_SUBMODULE: &str = "MQHost";

/// Log a trace line every this many pulses.
const PULSE_TRACE_INTERVAL: u64 = 10_000;

struct Services {
    // Programs go first: their dependencies remove commands from the registry below.
    submodules: SubmoduleRegistry,
    commands: CommandRegistry,
    events: EventHub,
    host: HostHandle,
    context: ExecutionContext,
}

impl Services {
    fn dependencies_for(&self, name: &str) -> Dependencies {
        Dependencies::new(
            name,
            self.commands.for_submodule(name),
            self.host.clone(),
            self.context.clone(),
            self.events.for_submodule(name),
        )
    }
}

/// Worker runtime owned by the plugin; shut down without blocking the host thread.
struct WorkerPool(Option<Runtime>);

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Builder for [`PluginHost`].
pub struct PluginHostBuilder {
    host_dir: PathBuf,
    surface: Arc<dyn HostSurface>,
    config: Option<HostConfig>,
    loader: Option<Arc<dyn ModuleLoader>>,
    runtime: Option<Handle>,
    init_logging: bool,
}

impl PluginHostBuilder {
    pub fn new(host_dir: impl AsRef<Path>, surface: Arc<dyn HostSurface>) -> Self {
        Self {
            host_dir: host_dir.as_ref().to_path_buf(),
            surface,
            config: None,
            loader: None,
            runtime: None,
            init_logging: true,
        }
    }

    /// Use `config` instead of reading the settings file.
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Load programs with `loader` instead of from dynamic libraries.
    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Run timers on an existing runtime instead of starting one.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Whether to install the global `tracing` subscriber.
    pub fn init_logging(mut self, init: bool) -> Self {
        self.init_logging = init;
        self
    }

    pub fn build(self) -> Result<PluginHost> {
        let config = match self.config {
            Some(config) => config,
            None => HostConfig::load(&self.host_dir.join(SETTINGS_FILE_NAME))?,
        };
        let dirs = HostDirs::with_layout(
            &self.host_dir,
            &config.programs_dir,
            &config.module_extension,
        )?;

        if self.init_logging && !logging::init(&config.logging, &dirs.logs_dir)? {
            tracing::debug!("Logging was already initialized");
        }
        tracing::info!("Initializing MQHost in {}", dirs.host_dir.display());

        let (pool, handle) = match self.runtime {
            Some(handle) => (WorkerPool(None), handle),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .thread_name("mqhost-worker")
                    .build()?;
                let handle = runtime.handle().clone();
                (WorkerPool(Some(runtime)), handle)
            }
        };

        let context = ExecutionContext::with_runtime(handle);
        let host = HostHandle::new(self.surface);

        let fault_host = host.clone();
        context.set_fault_handler(move |fault| {
            fault_host.error(
                MessageSource::General,
                &format!("{}. See the log file for more information.", fault),
            );
        });

        let loader = match self.loader {
            Some(loader) => loader,
            None => default_loader(&config, &dirs),
        };

        let services = Arc::new(Services {
            submodules: SubmoduleRegistry::new(
                context.clone(),
                host.clone(),
                dirs.clone(),
                loader,
                config.stop,
            ),
            commands: CommandRegistry::new(context.clone(), host.clone()),
            events: EventHub::new(config.event_channel_capacity),
            host,
            context,
        });

        register_builtin_commands(&services)?;
        tracing::info!("MQHost initialized");

        Ok(PluginHost {
            services,
            config,
            dirs,
            pulses: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            _pool: pool,
        })
    }
}

fn default_loader(config: &HostConfig, dirs: &HostDirs) -> Arc<dyn ModuleLoader> {
    let shared = SharedLibraries::new();
    shared.register(HOST_RUNTIME_NAME, Some(env!("CARGO_PKG_VERSION")));

    for library in &config.shared_libraries {
        let path = dirs.host_dir.join(&library.path);
        if let Err(e) = shared.load(&library.name, library.version.as_deref(), &path) {
            tracing::error!(
                "Failed to load shared library {} from {}: {}",
                library.name,
                path.display(),
                e
            );
        }
    }

    let shadow = ShadowCopies::new(dirs.shadow_dir.clone(), config.shadow_copy_modules);
    if shadow.is_enabled() {
        if let Err(e) = shadow.cleanup_stale() {
            tracing::warn!("Failed to clean up shadow copies: {}", e);
        }
    }

    Arc::new(DylibLoader::new(shadow, shared))
}

fn register_builtin_commands(services: &Arc<Services>) -> Result<()> {
    let commands = &services.commands;

    let weak = Arc::downgrade(services);
    commands.add_command(HOST_SUBMODULE, "/netrun", move |args| {
        net_run(&weak, args);
        Ok(())
    })?;

    let weak = Arc::downgrade(services);
    commands.add_async_command(HOST_SUBMODULE, "/netend", move |args, _cancel| {
        net_end(weak.clone(), args)
    })?;

    let weak = Arc::downgrade(services);
    commands.add_command(HOST_SUBMODULE, "/netlist", move |_args| {
        if let Some(services) = weak.upgrade() {
            services.submodules.print_running_programs()?;
            services.commands.print_running_commands()?;
        }
        Ok(())
    })?;

    let weak = Arc::downgrade(services);
    commands.add_command(HOST_SUBMODULE, "/netcancel", move |args| {
        let Some(services) = weak.upgrade() else {
            return Ok(());
        };
        let Some(target) = args.first() else {
            services
                .host
                .info(MessageSource::General, "Usage: /netcancel <command|*>");
            return Ok(());
        };

        let cancelled = if target == "*" {
            services.commands.cancel_all_async_command_tasks()
        } else {
            services.commands.cancel_async_command_task(target)
        };
        services.host.info(
            MessageSource::General,
            &format!("Cancelled {} running command(s)", cancelled),
        );
        Ok(())
    })?;

    Ok(())
}

fn net_run(services: &Weak<Services>, args: Vec<String>) {
    let Some(services) = services.upgrade() else {
        return;
    };
    let Some(name) = args.first().cloned() else {
        services.host.info(
            MessageSource::Program,
            "Usage: /netrun <program> [<arg1> <arg2> ...]",
        );
        return;
    };

    let deps = services.dependencies_for(&name);
    match services.submodules.start_program(&name, args, deps) {
        Ok(true) => {
            tracing::debug!("{} program started successfully", name);
            services.host.info(
                MessageSource::Program,
                &format!("{} program started successfully", name),
            );
        }
        Ok(false) => {
            tracing::warn!("Failed to start {} program!", name);
            services.host.warning(
                MessageSource::Program,
                &format!("Failed to start {} program!", name),
            );
        }
        Err(e) => {
            tracing::error!("Failed to start {} program: {}", name, e);
            services.host.error(
                MessageSource::Program,
                &format!("Failed to start {} program: {}", name, e),
            );
        }
    }
}

async fn net_end(services: Weak<Services>, args: Vec<String>) -> anyhow::Result<()> {
    let Some(registry) = services.upgrade() else {
        return Ok(());
    };
    if args.len() != 1 {
        registry
            .host
            .info(MessageSource::Program, "Usage: /netend <program|*>");
        return Ok(());
    }

    let name = &args[0];
    if name == "*" {
        let all = registry.submodules.stop_all_programs()?;
        if !all {
            registry
                .host
                .warning(MessageSource::Program, "Failed to stop/unload some programs!");
        }
        return Ok(());
    }

    let stopping = registry.submodules.try_stop_program(name);
    let host = registry.host.clone();
    // Don't keep the plugin alive across the grace periods.
    drop(registry);

    match stopping.await? {
        Some(outcome) if outcome.stopped => {
            tracing::debug!("{} program stopped and unloaded ({})", name, outcome.status);
            host.info(
                MessageSource::Program,
                &format!("{} program stopped and unloaded successfully", name),
            );
        }
        Some(outcome) => {
            tracing::info!(
                "{} program had already stopped before the forced stop ({})",
                name,
                outcome.status
            );
            host.info(
                MessageSource::Program,
                &format!("{} program had already stopped", name),
            );
        }
        None => {
            tracing::warn!("Failed to stop/unload {} program!", name);
            host.warning(
                MessageSource::Program,
                &format!("Failed to stop/unload {} program!", name),
            );
        }
    }
    Ok(())
}

/// The runtime as seen by the host: one instance per loaded plugin.
///
/// Every method must be called from the host thread.
pub struct PluginHost {
    services: Arc<Services>,
    config: HostConfig,
    dirs: HostDirs,
    pulses: AtomicU64,
    shut_down: AtomicBool,
    _pool: WorkerPool,
}

impl PluginHost {
    pub fn builder(host_dir: impl AsRef<Path>, surface: Arc<dyn HostSurface>) -> PluginHostBuilder {
        PluginHostBuilder::new(host_dir, surface)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn dirs(&self) -> &HostDirs {
        &self.dirs
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.services.context
    }

    pub fn host(&self) -> &HostHandle {
        &self.services.host
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.services.commands
    }

    pub fn submodules(&self) -> &SubmoduleRegistry {
        &self.services.submodules
    }

    pub fn events(&self) -> &EventHub {
        &self.services.events
    }

    /// Dependencies for a program named `name`.
    pub fn dependencies_for(&self, name: &str) -> Dependencies {
        self.services.dependencies_for(name)
    }

    /// Start a program as `/netrun` would. The program name is the first argument.
    pub fn start_program(&self, name: &str, args: Vec<String>) -> Result<bool> {
        let deps = self.dependencies_for(name);
        self.services.submodules.start_program(name, args, deps)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Periodic host callback: run queued continuations, then sweep.
    pub fn on_pulse(&self) {
        if self.is_shut_down() {
            return;
        }

        let pulse = self.pulses.fetch_add(1, Ordering::Relaxed) + 1;
        if pulse % PULSE_TRACE_INTERVAL == 0 {
            tracing::trace!("Pulse {}", pulse);
        }

        let context = &self.services.context;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| context.pump(true))) {
            let message = panic_message(payload.as_ref());
            tracing::error!("Continuation panicked during pulse: {}", message);
            self.services
                .host
                .error(MessageSource::Plugin, &format!("Pulse failed: {}", message));
        }

        let interval = u64::from(self.config.sweep_interval_pulses.max(1));
        if pulse % interval == 0 {
            let programs = self.services.submodules.process_running_program_tasks();
            let commands = self.services.commands.process_async_command_tasks();
            if programs + commands > 0 {
                tracing::debug!(
                    "Swept {} finished programs and {} finished commands",
                    programs,
                    commands
                );
            }
        }
    }

    /// Dispatch a command typed into the host. Returns whether it was ours.
    pub fn on_command(&self, name: &str, raw_arguments: &str) -> bool {
        if self.is_shut_down() {
            return false;
        }
        match self.services.commands.invoke(name, raw_arguments) {
            Ok(handled) => handled,
            Err(e) => {
                tracing::error!("Failed to dispatch {}: {}", name, e);
                false
            }
        }
    }

    /// Re-dispatch a lifecycle notification to subscribed submodules.
    pub fn on_event(&self, event: HostEvent) {
        if self.is_shut_down() {
            return;
        }
        match &event {
            HostEvent::Chat(_)
            | HostEvent::AddSpawn { .. }
            | HostEvent::RemoveSpawn { .. }
            | HostEvent::AddGroundItem { .. }
            | HostEvent::RemoveGroundItem { .. } => tracing::trace!("Host event {:?}", event),
            _ => tracing::debug!("Host event {:?}", event),
        }
        self.services.events.publish(event);
    }

    pub fn on_incoming_chat(&self, line: &str, color: u32) {
        self.on_event(HostEvent::Chat(ChatLine {
            source: ChatSource::Eq,
            text: line.to_string(),
            color,
            filter: None,
        }));
    }

    pub fn on_write_chat(&self, line: &str, color: u32, filter: u32) {
        self.on_event(HostEvent::Chat(ChatLine {
            source: ChatSource::Mq,
            text: line.to_string(),
            color,
            filter: Some(filter),
        }));
    }

    pub fn set_game_state(&self, state: u32) {
        self.on_event(HostEvent::GameStateChanged(GameState::from(state)));
    }

    /// Stop every program and remove every command. Later callbacks are ignored.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down MQHost");

        self.services.submodules.dispose();
        self.services.commands.dispose();
        let dropped = self.services.context.clear_queue();
        if dropped > 0 {
            tracing::debug!("Discarded {} queued continuations", dropped);
        }

        tracing::info!("MQHost shut down");
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("host_dir", &self.dirs.host_dir)
            .field("submodules", &self.services.submodules)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
