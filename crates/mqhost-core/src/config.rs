//! Host settings.
//!
//! Settings are read from `mqhost.settings.json` in the host directory. A
//! missing file yields the defaults; a malformed one is an error so that a
//! typo never silently disables logging.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Logging sinks and filter.
    pub logging: LoggingConfig,

    /// Name of the programs directory under the host directory.
    pub programs_dir: String,

    /// Module file extension, defaults to the platform's dynamic library extension.
    pub module_extension: String,

    /// Grace periods used when stopping a program cooperatively.
    pub stop: StopConfig,

    /// Run the task sweeps every N pulses.
    pub sweep_interval_pulses: u32,

    /// Capacity of the per-host lifecycle event channel.
    pub event_channel_capacity: usize,

    /// Load copies of module libraries so the originals can be replaced while loaded.
    pub shadow_copy_modules: bool,

    /// Libraries shared with every module instead of being loaded per module.
    pub shared_libraries: Vec<SharedLibraryConfig>,
}

/// A library the host loads once and shares with all modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedLibraryConfig {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Path relative to the host directory, or absolute.
    pub path: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            programs_dir: "Programs".to_string(),
            module_extension: std::env::consts::DLL_EXTENSION.to_string(),
            stop: StopConfig::default(),
            sweep_interval_pulses: 1,
            event_channel_capacity: 256,
            shadow_copy_modules: cfg!(windows),
            shared_libraries: Vec::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Write log lines to stderr.
    pub console: bool,

    /// Write log lines to `<host_dir>/logs/mqhost.log`.
    pub file: bool,

    /// `EnvFilter` directive, e.g. `"info"` or `"mqhost_core=debug"`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console: false,
            file: true,
            filter: "info".to_string(),
        }
    }
}

/// Bounded wait used by `SubmoduleRegistry::try_stop_program`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    pub first_grace_ms: u64,
    pub second_grace_ms: u64,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            first_grace_ms: 500,
            second_grace_ms: 1000,
        }
    }
}

impl StopConfig {
    pub fn first_grace(&self) -> Duration {
        Duration::from_millis(self.first_grace_ms)
    }

    pub fn second_grace(&self) -> Duration {
        Duration::from_millis(self.second_grace_ms)
    }
}

impl HostConfig {
    /// Load the configuration from `path`, falling back to defaults if the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = HostConfig::load(&temp.path().join("missing.json")).unwrap();

        assert_eq!(config, HostConfig::default());
        assert_eq!(config.stop.first_grace(), Duration::from_millis(500));
        assert_eq!(config.stop.second_grace(), Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_file_merges_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mqhost.settings.json");
        fs::write(
            &path,
            r#"{ "logging": { "console": true }, "stop": { "first_grace_ms": 50 } }"#,
        )
        .unwrap();

        let config = HostConfig::load(&path).unwrap();
        assert!(config.logging.console);
        assert!(config.logging.file);
        assert_eq!(config.logging.filter, "info");
        assert_eq!(config.stop.first_grace_ms, 50);
        assert_eq!(config.stop.second_grace_ms, 1000);
        assert_eq!(config.programs_dir, "Programs");
        assert!(config.shared_libraries.is_empty());
    }

    #[test]
    fn test_shared_libraries() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mqhost.settings.json");
        fs::write(
            &path,
            r#"{ "shadow_copy_modules": true,
                 "shared_libraries": [ { "name": "nav_mesh", "version": "2.0.0", "path": "lib/nav_mesh.so" } ] }"#,
        )
        .unwrap();

        let config = HostConfig::load(&path).unwrap();
        assert!(config.shadow_copy_modules);
        assert_eq!(config.shared_libraries.len(), 1);
        assert_eq!(config.shared_libraries[0].name, "nav_mesh");
        assert_eq!(config.shared_libraries[0].version.as_deref(), Some("2.0.0"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mqhost.settings.json");
        fs::write(&path, "{ not json").unwrap();

        let result = HostConfig::load(&path);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
