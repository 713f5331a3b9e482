//! Run command implementation for the MQHost CLI.
//!
//! Drives a [`PluginHost`] the way the game client would: a fixed-rate pulse,
//! commands typed on stdin, and chat lines for everything else.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use mqhost_core::{HostConfig, PluginHost, paths::SETTINGS_FILE_NAME};

use crate::colors;
use crate::console::{ConsoleHost, split_command_line};

/// Console-only commands, handled before anything reaches the runtime.
enum ConsoleCommand {
    Quit,
    Help,
    Echo,
}

fn console_command(name: &str) -> Option<ConsoleCommand> {
    match name {
        "/quit" | "/exit" => Some(ConsoleCommand::Quit),
        "/help" => Some(ConsoleCommand::Help),
        "/echo" => Some(ConsoleCommand::Echo),
        _ => None,
    }
}

/// Execute the run command.
pub async fn execute(
    host_dir: &Path,
    pulse_ms: u64,
    start: &[String],
    verbose: bool,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(host_dir)?;

    let mut config = HostConfig::load(&host_dir.join(SETTINGS_FILE_NAME))?;
    config.logging.console = true;
    if verbose {
        config.logging.filter = "debug".to_string();
    }

    let (console, mut loopback) = ConsoleHost::new();
    let console = Arc::new(console);
    let plugin = PluginHost::builder(host_dir, console.clone())
        .config(config)
        .runtime(tokio::runtime::Handle::current())
        .build()?;

    println!(
        "\n{}MQHost Console{} - {}{}{}",
        colors::BOLD,
        colors::RESET,
        colors::CYAN,
        plugin.dirs().host_dir.display(),
        colors::RESET
    );
    println!("{}", "─".repeat(50));
    println!(
        "{}Programs load from {}. Type /help for commands, /quit to exit.{}",
        colors::DIM,
        plugin.dirs().programs_dir.display(),
        colors::RESET
    );
    println!();

    for name in start {
        plugin.on_command("/netrun", name);
    }

    let mut lines = spawn_stdin_reader();
    let mut pulse = tokio::time::interval(Duration::from_millis(pulse_ms.max(1)));
    pulse.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = pulse.tick() => plugin.on_pulse(),

            Some(command) = loopback.recv() => {
                if !dispatch(&plugin, &console, &command) {
                    break;
                }
            }

            line = lines.recv() => match line {
                Some(line) => {
                    if !dispatch(&plugin, &console, &line) {
                        break;
                    }
                }
                None => break,
            },

            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    plugin.shutdown();
    println!("{}Stopped.{}", colors::DIM, colors::RESET);
    Ok(())
}

/// Read stdin on a detached thread so a pending read never holds up shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (sender, receiver) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) => {
                    if sender.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
    receiver
}

/// Handle one input line. Returns `false` when the console should exit.
fn dispatch(plugin: &PluginHost, console: &ConsoleHost, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }

    let Some((name, arguments)) = split_command_line(line) else {
        // Anything else is treated as an incoming chat line.
        plugin.on_incoming_chat(line, 0);
        return true;
    };

    match console_command(name) {
        Some(ConsoleCommand::Quit) => return false,
        Some(ConsoleCommand::Help) => {
            println!("{}Console:{} /echo /help /quit", colors::BOLD, colors::RESET);
            println!(
                "{}Registered:{} {}",
                colors::BOLD,
                colors::RESET,
                console.registered().join(" ")
            );
            return true;
        }
        Some(ConsoleCommand::Echo) => {
            // The host's own output is what MQ chat waiters listen to.
            plugin.host().write_line(arguments);
            plugin.on_write_chat(arguments, 0, 0);
            return true;
        }
        None => {}
    }

    if !plugin.on_command(name, arguments) {
        eprintln!(
            "{}Error:{} Unknown command: {}",
            colors::RED,
            colors::RESET,
            name
        );
    }
    true
}
