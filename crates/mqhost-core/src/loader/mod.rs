//! Isolated module loading.
//!
//! Each running submodule lives in its own [`ModuleDomain`]: the submodule
//! library, the private dependencies found next to it and the program types
//! it exports. Unloading the domain closes the libraries once nothing built
//! from them is alive.
//!
//! ```text
//! Programs/Foo/
//! ├── Foo.<ext>        ──► DylibLoader ──► ModuleDomain ──► ProgramType ──► ProgramInstance
//! ├── Foo.deps.json    ──► resolve (bound, shared, runtime, framework, private)
//! └── helper.<ext>     ──► loaded privately into the domain
//! ```

pub mod abi;
mod boundary;
mod domain;
mod dylib;
mod lease;
mod resolve;
mod shadow;
mod static_loader;

use std::io;
use std::path::PathBuf;

use crate::error::Result;
use crate::paths::HostDirs;

pub use boundary::ModuleScope;
pub use domain::{ModuleDomain, ProgramFactory, ProgramInstance, ProgramType, UnloadOutcome};
pub use dylib::DylibLoader;
pub use lease::{Leased, ModuleFuture, ModuleLease};
pub(crate) use lease::detach_error;
pub use resolve::{
    DependencyManifest, DependencySpec, HOST_RUNTIME_NAME, KNOWN_FRAMEWORKS, Resolution,
    ResolvedDependency, SharedLibraries, library_file_name, resolve_dependencies,
};
pub use shadow::{ShadowCopies, ShadowCopy};
pub use static_loader::StaticModuleLoader;

/// Where to find a submodule's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub name: String,
    pub module_path: PathBuf,
    pub manifest_path: PathBuf,
}

impl LoadRequest {
    pub fn for_program(dirs: &HostDirs, name: &str) -> Self {
        Self {
            name: name.to_string(),
            module_path: dirs.program_module_path(name),
            manifest_path: dirs.program_deps_manifest_path(name),
        }
    }
}

/// Loads a submodule into a new domain.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, request: &LoadRequest) -> Result<ModuleDomain>;
}

fn require_module_file(request: &LoadRequest) -> Result<()> {
    if request.module_path.is_file() {
        return Ok(());
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("module file not found: {}", request.module_path.display()),
    )
    .into())
}
