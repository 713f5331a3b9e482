//! MQHost CLI - run submodules against a console instead of the game client.

mod colors;
mod console;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mqhost")]
#[command(about = "Console host for MQHost submodules")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the host and read commands from stdin
    Run {
        /// Host directory containing `Programs/` (defaults to the user data dir)
        #[arg(long)]
        host_dir: Option<PathBuf>,

        /// Milliseconds between pulses
        #[arg(long, default_value = "50")]
        pulse_ms: u64,

        /// Start these programs right away
        #[arg(long = "start", value_name = "PROGRAM")]
        start: Vec<String>,
    },

    /// Print the resolved host directory layout
    Dirs {
        /// Host directory (defaults to the user data dir)
        #[arg(long)]
        host_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Helper to surface the runtime's error kind
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<mqhost_core::Error>() {
            anyhow::anyhow!("MQHost: {}", core_err)
        } else {
            err
        }
    };

    match cli.command {
        Commands::Run {
            host_dir,
            pulse_ms,
            start,
        } => {
            let host_dir = resolve_host_dir(host_dir)?;
            run::execute(&host_dir, pulse_ms, &start, cli.verbose)
                .await
                .map_err(format_error)?;
        }

        Commands::Dirs { host_dir } => {
            let host_dir = resolve_host_dir(host_dir)?;
            let dirs = mqhost_core::HostDirs::new(&host_dir)?;
            println!("host:     {}", dirs.host_dir.display());
            println!("programs: {}", dirs.programs_dir.display());
            println!("logs:     {}", dirs.logs_dir.display());
            println!("settings: {}", dirs.settings_path().display());
        }
    }

    Ok(())
}

/// Explicit directory, else `<data dir>/mqhost`.
fn resolve_host_dir(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(dir) => Ok(dir),
        None => dirs::data_local_dir()
            .map(|dir| dir.join("mqhost"))
            .ok_or_else(|| anyhow::anyhow!("No data directory on this platform; pass --host-dir")),
    }
}
