//! Sample submodule.
//!
//! Build it and install the library as `Programs/TestProgram/TestProgram.<ext>`
//! under the host directory, then `/netrun TestProgram`. While running it
//! provides `/testcommandasync [args]` (a long, cancellable loop) and
//! `/testapis` (host calls and chat waits).
//!
//! The library also exports `PanicDemo`, which panics shortly after it
//! starts; install it as `Programs/PanicDemo/PanicDemo.<ext>` to see a
//! failing program reported and unloaded without taking the host down.

use std::time::Duration;

use futures::FutureExt;

use mqhost_core::events::ChatChannel;
use mqhost_core::{BoxFuture, CancellationToken, Dependencies, MessageSource, Program};

const IDLE_TICK: Duration = Duration::from_secs(5);
const LOOP_TICK: Duration = Duration::from_millis(200);
const LOOP_COUNT: u32 = 1500;
const STEP_PAUSE: Duration = Duration::from_millis(500);
const PANIC_PAUSE: Duration = Duration::from_millis(10);

#[derive(Default)]
pub struct TestProgram;

impl Program for TestProgram {
    fn run(
        &mut self,
        _args: Vec<String>,
        deps: Dependencies,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        run(deps, cancel).boxed()
    }

    fn dispose(&mut self) {
        tracing::debug!("TestProgram disposed");
    }
}

async fn run(deps: Dependencies, cancel: CancellationToken) -> anyhow::Result<()> {
    deps.commands()
        .add_async_command("/testcommandasync", |args, cancel| test_command(args, cancel))?;

    let api_deps = deps.clone();
    deps.commands().add_async_command("/testapis", move |_args, cancel| {
        test_apis(api_deps.clone(), cancel)
    })?;

    while !cancel.is_cancelled() {
        if deps.delay(IDLE_TICK, &cancel).await.is_err() {
            tracing::trace!("TestProgram has been cancelled");
            break;
        }
    }
    Ok(())
}

/// Loop for about five minutes, logging every hundred iterations.
async fn test_command(args: Vec<String>, cancel: CancellationToken) -> anyhow::Result<()> {
    let run_id = uuid::Uuid::new_v4();
    tracing::info!(
        "Executing! [RunId: {}] [CommandArguments: {}]",
        run_id,
        args.join(", ")
    );

    for index in 0..LOOP_COUNT {
        if mqhost_core::delay(LOOP_TICK, &cancel).await.is_err() {
            tracing::debug!(
                "/testcommandasync has been cancelled! [RunId: {}] [CommandArguments: {}]",
                run_id,
                args.join(", ")
            );
            return Ok(());
        }

        if index % 100 == 0 {
            tracing::info!(
                "/testcommandasync [LoopIndex: {}] [RunId: {}] [Thread: {:?}]",
                index,
                run_id,
                std::thread::current().id()
            );
        }
    }
    Ok(())
}

async fn test_apis(deps: Dependencies, cancel: CancellationToken) -> anyhow::Result<()> {
    let host = deps.host().clone();
    host.write_line("Testing host calls");

    let name = host.parse_variables("${Me.Name}")?;
    host.write_line(&format!("{{Me.Name}}: {}", name));
    deps.delay(STEP_PAUSE, &cancel).await?;

    match host.evaluate_expression("${Target.ID}", true) {
        Ok(id) => host.write_line(&format!("{{Target.ID}}: {}", id)),
        Err(e) => host.write_line(&format!("{{Target.ID}}: (null) [{}]", e)),
    }
    deps.delay(STEP_PAUSE, &cancel).await?;

    host.send_command("/echo Hi! I'm ${Me.Name}");
    deps.delay(STEP_PAUSE, &cancel).await?;

    let chat = deps.chat()?;

    let hello = chat.wait_for(
        ChatChannel::Mq,
        |line| line.contains("Hello World"),
        Some(Duration::from_secs(10)),
        cancel.clone(),
    );
    host.send_command("/echo Hello World!");
    let matched = hello.await?;
    host.info(
        MessageSource::Program,
        &format!("WaitForChat was successful: {}", matched),
    );
    deps.delay(STEP_PAUSE, &cancel).await?;

    let never = chat.wait_for(
        ChatChannel::Mq,
        |line| line.contains("String that we're not going to actually type in"),
        Some(Duration::from_secs(5)),
        cancel.clone(),
    );
    host.send_command("/echo Hello World!");
    let matched = never.await?;
    host.info(
        MessageSource::Program,
        &format!("WaitForChat was successful: {}", matched),
    );
    Ok(())
}

#[derive(Default)]
pub struct PanicDemo;

impl Program for PanicDemo {
    fn run(
        &mut self,
        _args: Vec<String>,
        deps: Dependencies,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        give_up(deps, cancel).boxed()
    }
}

async fn give_up(deps: Dependencies, cancel: CancellationToken) -> anyhow::Result<()> {
    deps.delay(PANIC_PAUSE, &cancel).await?;
    tracing::warn!("PanicDemo is about to panic");
    panic!("PanicDemo gave up")
}

mqhost_core::declare_programs!(TestProgram, PanicDemo);

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use mqhost_core::host::RecordingHost;
    use mqhost_core::loader::abi::{MANIFEST_SYMBOL, PROGRAM_ABI_VERSION};
    use mqhost_core::{CommandRegistry, EventHub, ExecutionContext, HostHandle, TaskStatus};

    #[test]
    fn test_manifest_lists_programs() {
        let manifest = unsafe { &*mqhost_program_manifest() };
        assert_eq!(manifest.abi_version, PROGRAM_ABI_VERSION);
        assert_eq!(manifest.count, 2);
        assert_eq!(MANIFEST_SYMBOL, b"mqhost_program_manifest");

        let entries = unsafe { std::slice::from_raw_parts(manifest.entries, manifest.count) };
        let names: Vec<&str> = entries
            .iter()
            .map(|entry| unsafe { std::ffi::CStr::from_ptr(entry.type_name) }.to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["TestProgram", "PanicDemo"]);
        assert!(entries.iter().all(|entry| entry.constructor.is_some()));
    }

    #[test]
    fn test_program_registers_commands_and_stops_on_cancel() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let host = RecordingHost::new();
        let handle = HostHandle::new(host.clone());
        let context = ExecutionContext::with_runtime(runtime.handle().clone());
        let commands = CommandRegistry::new(context.clone(), handle.clone());
        let events = EventHub::new(8);
        let deps = Dependencies::new(
            "TestProgram",
            commands.for_submodule("TestProgram"),
            handle,
            context.clone(),
            events.for_submodule("TestProgram"),
        );

        let cancel = CancellationToken::new();
        let future = TestProgram.run(Vec::new(), deps, cancel.clone());
        let task = context.spawn("TestProgram", future, Some(cancel.clone()));

        context.pump(true);
        assert!(commands.is_registered("/testcommandasync"));
        assert!(commands.is_registered("/testapis"));
        assert_eq!(host.registered_commands().len(), 2);

        cancel.cancel();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !task.is_terminal() && Instant::now() < deadline {
            context.pump(true);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(task.status(), TaskStatus::Completed);
    }
}
