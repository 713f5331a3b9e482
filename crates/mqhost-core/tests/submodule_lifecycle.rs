//! Integration tests for the submodule lifecycle.
//!
//! Drives start, stop, sweep and bounded stop through a real execution
//! context backed by a tokio runtime, the way the host's pulse would.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tempfile::TempDir;

use mqhost_core::host::RecordingHost;
use mqhost_core::{
    BoxFuture, CancellationToken, CommandRegistry, Dependencies, Error, EventHub,
    ExecutionContext, HostDirs, HostHandle, Program, StaticModuleLoader, StopConfig, StopOutcome,
    SubmoduleRegistry, TaskStatus,
};

// =============================================================================
// Test Programs
// =============================================================================

const TICK: Duration = Duration::from_millis(5);

/// Registers `/looper` and ticks until cancelled.
#[derive(Default)]
struct Looper;

async fn run_looper(deps: Dependencies, cancel: CancellationToken) -> anyhow::Result<()> {
    deps.commands().add_command("/looper", |_| Ok(()))?;
    loop {
        deps.delay(TICK, &cancel).await?;
    }
}

impl Program for Looper {
    fn run(
        &mut self,
        _args: Vec<String>,
        deps: Dependencies,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        run_looper(deps, cancel).boxed()
    }
}

/// Finishes on its first poll.
#[derive(Default)]
struct Quick;

impl Program for Quick {
    fn run(
        &mut self,
        _args: Vec<String>,
        _deps: Dependencies,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }
}

/// Fails on its first poll.
#[derive(Default)]
struct Failing;

impl Program for Failing {
    fn run(
        &mut self,
        _args: Vec<String>,
        _deps: Dependencies,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        async { Err(anyhow::anyhow!("ran out of mana")) }.boxed()
    }
}

/// Ignores cancellation entirely.
#[derive(Default)]
struct Stubborn;

impl Program for Stubborn {
    fn run(
        &mut self,
        _args: Vec<String>,
        _deps: Dependencies,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        futures::future::pending().boxed()
    }
}

// =============================================================================
// Test Helpers
// =============================================================================

/// A host installation in a temporary directory with every registry wired up.
///
/// Field order is drop order: registries go before the runtime.
struct TestHost {
    submodules: SubmoduleRegistry,
    commands: CommandRegistry,
    events: EventHub,
    host: Arc<RecordingHost>,
    context: ExecutionContext,
    dirs: HostDirs,
    _temp: TempDir,
    runtime: tokio::runtime::Runtime,
}

impl TestHost {
    fn new(loader: StaticModuleLoader) -> Self {
        Self::with_stop(
            loader,
            StopConfig {
                first_grace_ms: 20,
                second_grace_ms: 40,
            },
        )
    }

    fn with_stop(loader: StaticModuleLoader, stop: StopConfig) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("Failed to build runtime");
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dirs = HostDirs::new(temp.path()).expect("Failed to create host layout");

        let host = RecordingHost::new();
        let handle = HostHandle::new(host.clone());
        let context = ExecutionContext::with_runtime(runtime.handle().clone());
        let commands = CommandRegistry::new(context.clone(), handle.clone());
        let submodules = SubmoduleRegistry::new(
            context.clone(),
            handle,
            dirs.clone(),
            Arc::new(loader),
            stop,
        );

        Self {
            submodules,
            commands,
            events: EventHub::new(16),
            host,
            context,
            dirs,
            _temp: temp,
            runtime,
        }
    }

    /// Drop an empty module file where the registry looks for `name`.
    fn install(&self, name: &str) {
        let path = self.dirs.program_module_path(name);
        fs::create_dir_all(path.parent().expect("module path has a parent"))
            .expect("Failed to create program dir");
        fs::write(&path, b"").expect("Failed to write module file");
    }

    fn deps(&self, name: &str) -> Dependencies {
        Dependencies::new(
            name,
            self.commands.for_submodule(name),
            HostHandle::new(self.host.clone()),
            self.context.clone(),
            self.events.for_submodule(name),
        )
    }

    fn start(&self, name: &str) -> mqhost_core::Result<bool> {
        self.submodules
            .start_program(name, vec![name.to_string()], self.deps(name))
    }

    /// Pump until `done` holds or two seconds pass.
    fn pump_until(&self, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            self.context.pump(true);
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn status_of(&self, name: &str) -> Option<TaskStatus> {
        let mut status = None;
        self.submodules
            .execute_for_each_submodule(|info| {
                if info.name == name {
                    status = Some(info.status);
                }
            })
            .expect("registry is live");
        status
    }
}

fn loader() -> StaticModuleLoader {
    let loader = StaticModuleLoader::new();
    loader
        .register_program::<Looper>("Looper", "Looper")
        .register_program::<Quick>("Quick", "Quick")
        .register_program::<Failing>("Failing", "Failing")
        .register_program::<Stubborn>("Stubborn", "Stubborn");
    loader
}

// =============================================================================
// Start / Stop
// =============================================================================

#[test]
fn test_start_stop_scenario() {
    let test = TestHost::new(loader());

    // No module file yet.
    assert!(!test.start("Looper").expect("start should not error"));
    assert!(!test.submodules.is_running("Looper"));

    test.install("Looper");
    assert!(test.start("Looper").expect("start should not error"));
    assert!(!test.start("Looper").expect("start should not error"));
    assert_eq!(test.submodules.running_program_names(), vec!["Looper"]);

    assert!(test.submodules.stop_program("Looper").expect("stop"));
    assert!(!test.submodules.stop_program("Looper").expect("stop"));
    assert!(test.submodules.is_empty());
}

#[test]
fn test_empty_name_is_an_error() {
    let test = TestHost::new(loader());
    assert!(matches!(test.start("  "), Err(Error::InvalidName { .. })));
    assert!(matches!(
        test.submodules.stop_program(""),
        Err(Error::InvalidName { .. })
    ));
}

#[test]
fn test_missing_constructor_is_an_error() {
    let loader = StaticModuleLoader::new();
    loader.register_without_constructor("Abstract", "Abstract");
    let test = TestHost::new(loader);
    test.install("Abstract");

    assert!(matches!(
        test.start("Abstract"),
        Err(Error::MissingConstructor { .. })
    ));
    assert!(!test.submodules.is_running("Abstract"));
}

#[test]
fn test_unresolved_dependency_fails_quietly() {
    let test = TestHost::new(loader());
    test.install("Quick");
    fs::write(
        test.dirs.program_deps_manifest_path("Quick"),
        r#"{"dependencies":[{"name":"mystery_lib","version":"1.0"}]}"#,
    )
    .expect("Failed to write manifest");

    assert!(!test.start("Quick").expect("load failures are not errors"));
    assert!(!test.submodules.is_running("Quick"));
}

#[test]
fn test_concurrent_starts_succeed_once() {
    let test = TestHost::new(loader());
    test.install("Looper");

    let successes = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                if test.start("Looper").expect("start should not error") {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(test.submodules.len(), 1);
}

#[test]
fn test_program_commands_removed_on_stop() {
    let test = TestHost::new(loader());
    test.install("Looper");
    assert!(test.start("Looper").expect("start"));

    assert!(test.pump_until(|| test.commands.is_registered("/looper")));
    assert_eq!(test.commands.owner_of("/looper").as_deref(), Some("Looper"));

    assert!(test.submodules.stop_program("Looper").expect("stop"));
    assert!(!test.commands.is_registered("/looper"));
    assert!(!test.host.registered_commands().contains(&"/looper".to_string()));
}

#[test]
fn test_already_running_start_keeps_commands() {
    let test = TestHost::new(loader());
    test.install("Looper");
    assert!(test.start("Looper").expect("start"));
    assert!(test.pump_until(|| test.commands.is_registered("/looper")));

    assert!(!test.start("Looper").expect("start"));
    assert!(test.commands.is_registered("/looper"));
}

// =============================================================================
// Sweep
// =============================================================================

#[test]
fn test_sweep_reclaims_completed_program() {
    let test = TestHost::new(loader());
    test.install("Quick");
    assert!(test.start("Quick").expect("start"));

    assert!(test.pump_until(|| test.status_of("Quick").is_none()));
    assert!(!test.submodules.is_running("Quick"));
    assert!(!test.host.saw("failed"));
}

#[test]
fn test_sweep_reports_faulted_program() {
    let test = TestHost::new(loader());
    test.install("Failing");
    assert!(test.start("Failing").expect("start"));

    test.context.pump(true);
    assert_eq!(test.submodules.process_running_program_tasks(), 1);
    assert!(test.host.saw("Failing failed: ran out of mana"));
    assert!(test.submodules.is_empty());
}

#[test]
fn test_print_running_programs() {
    let test = TestHost::new(loader());
    test.submodules.print_running_programs().expect("print");
    assert!(test.host.saw("No programs are running."));

    test.install("Looper");
    assert!(test.start("Looper").expect("start"));
    test.submodules.print_running_programs().expect("print");
    assert!(test.host.saw("Looper is currently running. [Elapsed Time:"));
}

// =============================================================================
// Bounded Stop
// =============================================================================

#[test]
fn test_try_stop_cooperative_program() {
    let test = TestHost::new(loader());
    test.install("Looper");
    assert!(test.start("Looper").expect("start"));
    test.context.pump(true);

    let stop = test.runtime.spawn(test.submodules.try_stop_program("Looper"));
    assert!(test.pump_until(|| stop.is_finished()));

    let outcome = test
        .runtime
        .block_on(stop)
        .expect("stop task panicked")
        .expect("stop failed");
    assert_eq!(
        outcome,
        Some(StopOutcome {
            status: TaskStatus::Cancelled,
            stopped: true,
        })
    );
    assert!(!test.submodules.is_running("Looper"));
    assert!(test.host.saw("Done stopping program: Looper"));
}

#[test]
fn test_try_stop_forces_stubborn_program() {
    let test = TestHost::new(loader());
    test.install("Stubborn");
    assert!(test.start("Stubborn").expect("start"));
    test.context.pump(true);

    let stop = test.runtime.spawn(test.submodules.try_stop_program("Stubborn"));
    assert!(test.pump_until(|| stop.is_finished()));

    let outcome = test
        .runtime
        .block_on(stop)
        .expect("stop task panicked")
        .expect("stop failed")
        .expect("Stubborn was running");
    // Cancellation fires with the first poll after the request.
    assert!(matches!(
        outcome.status,
        TaskStatus::Cancelled | TaskStatus::Scheduled | TaskStatus::Running
    ));
    assert!(outcome.stopped);
    assert!(!test.submodules.is_running("Stubborn"));
}

#[test]
fn test_try_stop_spares_restarted_instance() {
    let test = TestHost::with_stop(
        loader(),
        StopConfig {
            first_grace_ms: 50,
            second_grace_ms: 50,
        },
    );
    test.install("Looper");
    assert!(test.start("Looper").expect("start"));
    test.context.pump(true);

    let stop = test.runtime.spawn(test.submodules.try_stop_program("Looper"));

    // Stopped and started again while the bounded stop is still waiting.
    assert!(test.submodules.stop_program("Looper").expect("stop"));
    assert!(test.start("Looper").expect("restart"));
    assert!(test.pump_until(|| test.commands.is_registered("/looper")));

    assert!(test.pump_until(|| stop.is_finished()));
    let outcome = test
        .runtime
        .block_on(stop)
        .expect("stop task panicked")
        .expect("stop failed")
        .expect("Looper was running");

    assert!(!outcome.stopped);
    assert!(test.submodules.is_running("Looper"));
    assert!(test.commands.is_registered("/looper"));
    assert_eq!(test.status_of("Looper"), Some(TaskStatus::Running));
    assert!(!test.host.saw("Done stopping program: Looper"));
}

#[test]
fn test_try_stop_unknown_program() {
    let test = TestHost::new(loader());
    let outcome = test
        .runtime
        .block_on(test.submodules.try_stop_program("Nobody"))
        .expect("stop failed");
    assert_eq!(outcome, None);
}

// =============================================================================
// Disposal
// =============================================================================

#[test]
fn test_dispose_stops_everything() {
    let test = TestHost::new(loader());
    test.install("Looper");
    test.install("Stubborn");
    assert!(test.start("Looper").expect("start"));
    assert!(test.start("Stubborn").expect("start"));
    assert!(test.pump_until(|| test.commands.is_registered("/looper")));

    test.submodules.dispose();
    test.submodules.dispose();

    assert!(test.submodules.is_empty());
    assert!(!test.commands.is_registered("/looper"));
    assert!(matches!(test.start("Looper"), Err(Error::Disposed(_))));
}

#[test]
fn test_pump_without_work_is_noop() {
    let test = TestHost::new(loader());
    assert_eq!(test.context.pump(false), 0);
    assert_eq!(test.context.pump(false), 0);
}
