//! Host directory management.
//!
//! Provides the directory layout shared by the plugin, the console host and
//! the submodule registry so every component resolves program files the
//! same way.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Name of the settings file looked up in the host directory.
pub const SETTINGS_FILE_NAME: &str = "mqhost.settings.json";

/// Directory structure of a host installation.
///
/// ```text
/// <host_dir>/
/// ├── mqhost.settings.json   # Optional settings
/// ├── logs/                  # File logging output
/// ├── shadow/                # Shadow copies of loaded modules
/// └── Programs/
///     └── <Name>/
///         ├── <Name>.<ext>   # Submodule library
///         ├── <Name>.deps.json (optional dependency manifest)
///         └── ...            # Private dependencies searched by the loader
/// ```
#[derive(Debug, Clone)]
pub struct HostDirs {
    /// Root directory of the host installation.
    pub host_dir: PathBuf,

    /// Directory holding one sub-directory per submodule.
    pub programs_dir: PathBuf,

    /// Directory for log files.
    pub logs_dir: PathBuf,

    /// Directory for shadow copies of loaded modules. Created on first use.
    pub shadow_dir: PathBuf,

    /// Module file extension without the leading dot.
    pub module_extension: String,
}

impl HostDirs {
    /// Create the layout rooted at `host_dir`.
    ///
    /// Creates the programs and logs directories if they don't exist.
    ///
    /// # Errors
    /// Returns an error if directory creation fails.
    pub fn new(host_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_layout(host_dir, "Programs", std::env::consts::DLL_EXTENSION)
    }

    /// Create the layout with a custom programs directory name and module extension.
    pub fn with_layout(
        host_dir: impl AsRef<Path>,
        programs_dir_name: &str,
        module_extension: &str,
    ) -> Result<Self> {
        let host_dir = host_dir.as_ref().to_path_buf();
        let programs_dir = host_dir.join(programs_dir_name);
        let logs_dir = host_dir.join("logs");
        let shadow_dir = host_dir.join("shadow");

        fs::create_dir_all(&programs_dir)?;
        fs::create_dir_all(&logs_dir)?;

        Ok(Self {
            host_dir,
            programs_dir,
            logs_dir,
            shadow_dir,
            module_extension: module_extension.trim_start_matches('.').to_string(),
        })
    }

    /// Directory that holds a submodule's files.
    pub fn program_dir(&self, name: &str) -> PathBuf {
        self.programs_dir.join(name)
    }

    /// `<programs>/<name>/<name>.<ext>`, the file required to start a submodule.
    pub fn program_module_path(&self, name: &str) -> PathBuf {
        self.program_dir(name)
            .join(format!("{}.{}", name, self.module_extension))
    }

    /// Optional dependency manifest next to the module file.
    pub fn program_deps_manifest_path(&self, name: &str) -> PathBuf {
        self.program_dir(name).join(format!("{}.deps.json", name))
    }

    /// Path of the settings file.
    pub fn settings_path(&self) -> PathBuf {
        self.host_dir.join(SETTINGS_FILE_NAME)
    }
}
