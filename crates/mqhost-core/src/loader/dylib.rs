//! Loading submodule libraries with `libloading`.

use std::ffi::CStr;
use std::sync::Arc;

use libloading::Library;

use crate::error::{Error, Result};

use super::abi::{MANIFEST_SYMBOL, ManifestFn, PROGRAM_ABI_VERSION, RUNTIME_VERSION};
use super::domain::{Constructor, ModuleDomain, ProgramType};
use super::lease::LoadedModule;
use super::resolve::{DependencyManifest, Resolution, SharedLibraries, resolve_dependencies};
use super::shadow::ShadowCopies;
use super::{LoadRequest, ModuleLoader, require_module_file};

/// Loads submodules from dynamic libraries.
///
/// Private dependencies are loaded before the submodule library so the
/// platform loader finds them already mapped, and closed after it.
pub struct DylibLoader {
    shadow: Arc<ShadowCopies>,
    shared: Arc<SharedLibraries>,
}

impl DylibLoader {
    pub fn new(shadow: Arc<ShadowCopies>, shared: Arc<SharedLibraries>) -> Self {
        Self { shadow, shared }
    }

    pub fn shared(&self) -> &Arc<SharedLibraries> {
        &self.shared
    }
}

impl ModuleLoader for DylibLoader {
    fn load(&self, request: &LoadRequest) -> Result<ModuleDomain> {
        require_module_file(request)?;

        let manifest = DependencyManifest::load(&request.manifest_path)?;
        let module_dir = request
            .module_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."));
        let dependencies = resolve_dependencies(&request.name, &manifest, &self.shared, module_dir)?;

        let mut private = Vec::new();
        for dependency in &dependencies {
            if let Resolution::Private(path) = &dependency.resolution {
                // SAFETY: private dependencies ship with the submodule and are
                // trusted like the submodule itself.
                let library = unsafe { Library::new(path) }?;
                tracing::debug!("Loaded private dependency {}", path.display());
                private.push((path.clone().into_os_string(), library));
            }
        }

        let shadow = self.shadow.prepare(&request.module_path)?;
        let load_path = shadow
            .as_ref()
            .map(|copy| copy.path().to_path_buf())
            .unwrap_or_else(|| request.module_path.clone());

        // SAFETY: loading runs the library's initializers. Submodule libraries
        // are placed in the programs directory by the host operator.
        let library = match unsafe { Library::new(&load_path) } {
            Ok(library) => library,
            Err(e) => {
                if let Some(copy) = shadow {
                    copy.release();
                }
                return Err(e.into());
            }
        };

        tracing::info!(
            "Loaded module {} from {}",
            request.name,
            load_path.display()
        );

        // From here on dropping `module` closes everything loaded so far.
        let module = LoadedModule::new(request.name.clone(), library, private, shadow);
        let programs = read_manifest(&request.name, &module)?;

        Ok(ModuleDomain::new(
            request.name.clone(),
            request.module_path.clone(),
            programs,
            dependencies,
            Some(Arc::new(module)),
        ))
    }
}

fn abi_error(module: &str, message: impl Into<String>) -> Error {
    Error::ModuleAbi {
        module: module.to_string(),
        message: message.into(),
    }
}

fn read_manifest(name: &str, module: &LoadedModule) -> Result<Vec<ProgramType>> {
    let library = module
        .library()
        .ok_or_else(|| abi_error(name, "library already closed"))?;

    // SAFETY: the symbol type matches `declare_programs!`.
    let manifest_fn = match unsafe { library.get::<ManifestFn>(MANIFEST_SYMBOL) } {
        Ok(symbol) => *symbol,
        Err(e) => {
            tracing::error!("{} does not export a program manifest: {}", name, e);
            return Err(Error::MissingProgramContract {
                module: name.to_string(),
            });
        }
    };

    // SAFETY: the manifest function only returns a pointer to static data.
    let manifest = unsafe { manifest_fn() };
    // SAFETY: non-null manifests point at a static `ProgramManifest`.
    let Some(manifest) = (unsafe { manifest.as_ref() }) else {
        return Err(abi_error(name, "manifest is null"));
    };

    if manifest.abi_version != PROGRAM_ABI_VERSION {
        return Err(abi_error(
            name,
            format!(
                "manifest ABI version {} (expected {})",
                manifest.abi_version, PROGRAM_ABI_VERSION
            ),
        ));
    }

    let expected = RUNTIME_VERSION.trim_end_matches('\0');
    let runtime_version = if manifest.runtime_version.is_null() {
        String::new()
    } else {
        // SAFETY: `runtime_version` is a NUL-terminated static string.
        unsafe { CStr::from_ptr(manifest.runtime_version) }
            .to_string_lossy()
            .into_owned()
    };
    if runtime_version != expected {
        return Err(abi_error(
            name,
            format!(
                "built against mqhost-core {} (host is {})",
                runtime_version, expected
            ),
        ));
    }

    if manifest.count == 0 || manifest.entries.is_null() {
        return Ok(Vec::new());
    }

    // SAFETY: `entries` points at `count` static entries.
    let entries = unsafe { std::slice::from_raw_parts(manifest.entries, manifest.count) };
    let mut programs = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.type_name.is_null() {
            return Err(abi_error(name, "program entry without a type name"));
        }
        // SAFETY: type names are NUL-terminated static strings.
        let type_name = unsafe { CStr::from_ptr(entry.type_name) }
            .to_string_lossy()
            .into_owned();
        programs.push(ProgramType::new(
            type_name,
            entry.constructor.map(Constructor::Native),
        ));
    }

    Ok(programs)
}
