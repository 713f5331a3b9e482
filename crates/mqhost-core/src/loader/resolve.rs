//! Dependency manifests and resolution.
//!
//! A module may ship `<name>.deps.json` next to its library:
//!
//! ```json
//! { "dependencies": [ { "name": "mqhost_core", "version": "0.1.0" },
//!                     { "name": "nav_mesh" } ] }
//! ```
//!
//! Every listed dependency must be bound before the program runs. Resolution
//! tries, in order:
//!
//! 1. already bound in this domain
//! 2. an identical (same name and version) library in the host's shared set
//! 3. the runtime itself (`mqhost_core`) at the host's version
//! 4. a known framework library linked into the host
//! 5. a same-named library file in the module's own directory, loaded privately
//!
//! Anything else is unresolved and the load fails.
//!
//! A submodule library links its runtime statically, so binding to the host
//! runtime means the two copies agree on layout and the library reaches host
//! state only through the services in its dependencies (see
//! [`ModuleScope`](super::ModuleScope)). A different runtime version cannot
//! be bound.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use libloading::Library;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Library name of this runtime.
pub const HOST_RUNTIME_NAME: &str = "mqhost_core";

/// Framework libraries that are part of every host build.
pub const KNOWN_FRAMEWORKS: &[&str] = &["std", "core", "alloc", "tokio", "tokio_util", "futures"];

/// One entry of a `.deps.json` manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Contents of a `.deps.json` manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyManifest {
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
}

impl DependencyManifest {
    /// Read the manifest at `path`. A missing file means no dependencies.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&contents).map_err(|e| Error::ModuleAbi {
            module: path.display().to_string(),
            message: format!("malformed dependency manifest: {}", e),
        })
    }
}

/// How a dependency was bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    AlreadyBound,
    Shared,
    HostRuntime,
    Framework,
    Private(PathBuf),
}

/// A dependency together with how it was bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub spec: DependencySpec,
    pub resolution: Resolution,
}

struct SharedLibrary {
    version: Option<String>,
    _library: Option<Arc<Library>>,
}

/// Libraries the host shares with every domain.
///
/// Types that cross the host/module boundary must come from one instance;
/// registering a library here makes every module that lists the same name
/// and version bind to it instead of loading its own copy.
#[derive(Default)]
pub struct SharedLibraries {
    entries: DashMap<String, SharedLibrary>,
}

impl SharedLibraries {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Share a library already linked into the host.
    pub fn register(&self, name: &str, version: Option<&str>) {
        tracing::debug!("Sharing {} {:?} with all modules", name, version);
        self.entries.insert(
            name.to_string(),
            SharedLibrary {
                version: version.map(str::to_string),
                _library: None,
            },
        );
    }

    /// Load `path` once and share it.
    pub fn load(&self, name: &str, version: Option<&str>, path: &Path) -> Result<()> {
        // SAFETY: loading runs the library's initializers; shared libraries are
        // configured by the host operator.
        let library = unsafe { Library::new(path) }?;
        tracing::info!("Loaded shared library {} from {}", name, path.display());
        self.entries.insert(
            name.to_string(),
            SharedLibrary {
                version: version.map(str::to_string),
                _library: Some(Arc::new(library)),
            },
        );
        Ok(())
    }

    /// Whether an identical library is shared.
    pub fn contains(&self, name: &str, version: Option<&str>) -> bool {
        self.entries
            .get(name)
            .is_some_and(|entry| entry.version.as_deref() == version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// File name a private dependency is looked up under.
pub fn library_file_name(name: &str) -> Vec<PathBuf> {
    let platform = PathBuf::from(libloading::library_filename(name));
    let plain = PathBuf::from(format!("{}.{}", name, std::env::consts::DLL_EXTENSION));
    if platform == plain {
        vec![platform]
    } else {
        vec![platform, plain]
    }
}

/// Resolve every dependency of `module`, in manifest order.
pub fn resolve_dependencies(
    module: &str,
    manifest: &DependencyManifest,
    shared: &SharedLibraries,
    module_dir: &Path,
) -> Result<Vec<ResolvedDependency>> {
    let mut bound: HashSet<String> = HashSet::new();
    let mut resolved = Vec::with_capacity(manifest.dependencies.len());

    for spec in &manifest.dependencies {
        let resolution = resolve_one(module, spec, &bound, shared, module_dir)?;
        tracing::debug!("{}: {} resolved as {:?}", module, spec.name, resolution);
        bound.insert(spec.name.clone());
        resolved.push(ResolvedDependency {
            spec: spec.clone(),
            resolution,
        });
    }

    Ok(resolved)
}

fn resolve_one(
    module: &str,
    spec: &DependencySpec,
    bound: &HashSet<String>,
    shared: &SharedLibraries,
    module_dir: &Path,
) -> Result<Resolution> {
    if bound.contains(&spec.name) {
        return Ok(Resolution::AlreadyBound);
    }

    if shared.contains(&spec.name, spec.version.as_deref()) {
        return Ok(Resolution::Shared);
    }

    if spec.name == HOST_RUNTIME_NAME {
        let host_version = env!("CARGO_PKG_VERSION");
        match spec.version.as_deref() {
            None => return Ok(Resolution::HostRuntime),
            Some(version) if version == host_version => return Ok(Resolution::HostRuntime),
            Some(version) => {
                tracing::error!(
                    "Module {} was built against {} {}, host runs {}",
                    module,
                    HOST_RUNTIME_NAME,
                    version,
                    host_version
                );
                return Err(Error::DependencyUnresolved {
                    module: module.to_string(),
                    dependency: format!("{} {}", HOST_RUNTIME_NAME, version),
                });
            }
        }
    }

    if KNOWN_FRAMEWORKS.contains(&spec.name.as_str()) {
        return Ok(Resolution::Framework);
    }

    for file_name in library_file_name(&spec.name) {
        let candidate = module_dir.join(file_name);
        if candidate.is_file() {
            return Ok(Resolution::Private(candidate));
        }
    }

    tracing::error!(
        "Unable to resolve dependency {} for module {}",
        spec.name,
        module
    );
    Err(Error::DependencyUnresolved {
        module: module.to_string(),
        dependency: spec.name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(name: &str, version: Option<&str>) -> DependencySpec {
        DependencySpec {
            name: name.to_string(),
            version: version.map(str::to_string),
        }
    }

    fn manifest(specs: Vec<DependencySpec>) -> DependencyManifest {
        DependencyManifest {
            dependencies: specs,
        }
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let temp = TempDir::new().unwrap();
        let loaded = DependencyManifest::load(&temp.path().join("Foo.deps.json")).unwrap();
        assert!(loaded.dependencies.is_empty());
    }

    #[test]
    fn test_malformed_manifest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Foo.deps.json");
        fs::write(&path, "[").unwrap();
        assert!(matches!(
            DependencyManifest::load(&path),
            Err(Error::ModuleAbi { .. })
        ));
    }

    #[test]
    fn test_resolution_order() {
        let temp = TempDir::new().unwrap();
        let shared = SharedLibraries::new();
        shared.register("nav_mesh", Some("2.0.0"));

        let private = temp.path().join(&library_file_name("helper")[0]);
        fs::write(&private, b"x").unwrap();

        let deps = manifest(vec![
            spec("nav_mesh", Some("2.0.0")),
            spec("nav_mesh", Some("2.0.0")),
            spec(HOST_RUNTIME_NAME, Some(env!("CARGO_PKG_VERSION"))),
            spec("tokio", None),
            spec("helper", None),
        ]);

        let resolved = resolve_dependencies("Foo", &deps, &shared, temp.path()).unwrap();
        let kinds: Vec<Resolution> = resolved.into_iter().map(|r| r.resolution).collect();
        assert_eq!(
            kinds,
            vec![
                Resolution::Shared,
                Resolution::AlreadyBound,
                Resolution::HostRuntime,
                Resolution::Framework,
                Resolution::Private(private),
            ]
        );
    }

    #[test]
    fn test_host_runtime_requires_host_version() {
        let temp = TempDir::new().unwrap();
        let shared = SharedLibraries::new();

        let unversioned = manifest(vec![spec(HOST_RUNTIME_NAME, None)]);
        let resolved = resolve_dependencies("Foo", &unversioned, &shared, temp.path()).unwrap();
        assert_eq!(resolved[0].resolution, Resolution::HostRuntime);

        let stale = manifest(vec![spec(HOST_RUNTIME_NAME, Some("0.0.1-old"))]);
        let err = resolve_dependencies("Foo", &stale, &shared, temp.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::DependencyUnresolved { ref dependency, .. } if dependency == "mqhost_core 0.0.1-old"
        ));
    }

    #[test]
    fn test_shared_requires_identical_version() {
        let temp = TempDir::new().unwrap();
        let shared = SharedLibraries::new();
        shared.register("nav_mesh", Some("2.0.0"));

        let deps = manifest(vec![spec("nav_mesh", Some("1.0.0"))]);
        let err = resolve_dependencies("Foo", &deps, &shared, temp.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::DependencyUnresolved { ref dependency, .. } if dependency == "nav_mesh"
        ));
    }

    #[test]
    fn test_shared_wins_over_private_copy() {
        let temp = TempDir::new().unwrap();
        let shared = SharedLibraries::new();
        shared.register("helper", None);
        fs::write(temp.path().join(&library_file_name("helper")[0]), b"x").unwrap();

        let deps = manifest(vec![spec("helper", None)]);
        let resolved = resolve_dependencies("Foo", &deps, &shared, temp.path()).unwrap();
        assert_eq!(resolved[0].resolution, Resolution::Shared);
    }
}
