//! Logging setup.
//!
//! All components log through `tracing`. The host installs a subscriber once,
//! from its settings; `RUST_LOG` overrides the configured filter.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;
use crate::error::Result;

/// File name used for file logging inside the logs directory.
pub const LOG_FILE_NAME: &str = "mqhost.log";

/// Install the global subscriber.
///
/// Returns `Ok(false)` if a subscriber was already installed (e.g. the plugin
/// was re-initialized without a process restart).
pub fn init(config: &LoggingConfig, logs_dir: &Path) -> Result<bool> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = config.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let file_layer = if config.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs_dir.join(LOG_FILE_NAME))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_ids(true)
                .with_writer(Mutex::new(file)),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    Ok(installed)
}
