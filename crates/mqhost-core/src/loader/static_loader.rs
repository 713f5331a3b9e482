//! In-process module registrations.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Result;
use crate::program::Program;

use super::abi::ExportedProgram;
use super::domain::{Constructor, ModuleDomain, ProgramType};
use super::resolve::{DependencyManifest, SharedLibraries, resolve_dependencies};
use super::{LoadRequest, ModuleLoader, require_module_file};

/// Serves program types compiled into the host.
///
/// The module file must still exist, so programs start and stop under the
/// same rules as library-backed ones. Domains from this loader hold no
/// library and always unload as reclaimed.
#[derive(Default)]
pub struct StaticModuleLoader {
    modules: DashMap<String, Vec<ProgramType>>,
    shared: Arc<SharedLibraries>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shared(shared: Arc<SharedLibraries>) -> Self {
        Self {
            modules: DashMap::new(),
            shared,
        }
    }

    /// Export `P` from `module` under `type_name`.
    pub fn register_program<P>(&self, module: &str, type_name: &str) -> &Self
    where
        P: Program + Default,
    {
        self.register_factory(module, type_name, || {
            Box::new(ExportedProgram::new(P::default())) as Box<dyn Program>
        })
    }

    /// Export a program built by `factory`.
    pub fn register_factory<F>(&self, module: &str, type_name: &str, factory: F) -> &Self
    where
        F: Fn() -> Box<dyn Program> + Send + Sync + 'static,
    {
        self.push(
            module,
            ProgramType::new(
                type_name.to_string(),
                Some(Constructor::Static(Arc::new(factory))),
            ),
        )
    }

    /// Export a type that cannot be constructed.
    pub fn register_without_constructor(&self, module: &str, type_name: &str) -> &Self {
        self.push(module, ProgramType::new(type_name.to_string(), None))
    }

    fn push(&self, module: &str, program: ProgramType) -> &Self {
        self.modules
            .entry(module.to_string())
            .or_default()
            .push(program);
        self
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load(&self, request: &LoadRequest) -> Result<ModuleDomain> {
        require_module_file(request)?;

        let manifest = DependencyManifest::load(&request.manifest_path)?;
        let module_dir = request
            .module_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."));
        let dependencies = resolve_dependencies(&request.name, &manifest, &self.shared, module_dir)?;

        let programs = self
            .modules
            .get(&request.name)
            .map(|programs| programs.clone())
            .unwrap_or_default();

        tracing::debug!(
            "Loaded in-process module {} with {} program types",
            request.name,
            programs.len()
        );

        Ok(ModuleDomain::new(
            request.name.clone(),
            request.module_path.clone(),
            programs,
            dependencies,
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::program::Dependencies;
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use std::fs;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Farmer;

    impl Program for Farmer {
        fn run(
            &mut self,
            _args: Vec<String>,
            _deps: Dependencies,
            _cancel: CancellationToken,
        ) -> BoxFuture<'static, anyhow::Result<()>> {
            async { Ok(()) }.boxed()
        }
    }

    fn request(temp: &TempDir, name: &str) -> LoadRequest {
        let dir = temp.path().join(name);
        fs::create_dir_all(&dir).unwrap();
        let module_path = dir.join(format!("{}.so", name));
        fs::write(&module_path, b"").unwrap();
        LoadRequest {
            name: name.to_string(),
            module_path,
            manifest_path: dir.join(format!("{}.deps.json", name)),
        }
    }

    #[test]
    fn test_load_registered_programs() {
        let temp = TempDir::new().unwrap();
        let loader = StaticModuleLoader::new();
        loader
            .register_program::<Farmer>("Farmer", "Farmer")
            .register_without_constructor("Farmer", "Broken");

        let domain = loader.load(&request(&temp, "Farmer")).unwrap();
        assert_eq!(domain.programs().len(), 2);
        assert!(!domain.lease().is_pinned());

        let program = domain.select_program("Farmer").unwrap();
        assert!(program.instantiate(domain.lease()).is_ok());
    }

    #[test]
    fn test_unregistered_module_has_no_programs() {
        let temp = TempDir::new().unwrap();
        let loader = StaticModuleLoader::new();

        let domain = loader.load(&request(&temp, "Nothing")).unwrap();
        assert!(matches!(
            domain.select_program("Nothing"),
            Err(Error::MissingProgramContract { .. })
        ));
    }

    #[test]
    fn test_requires_module_file() {
        let temp = TempDir::new().unwrap();
        let loader = StaticModuleLoader::new();
        loader.register_program::<Farmer>("Farmer", "Farmer");

        let request = LoadRequest {
            name: "Farmer".to_string(),
            module_path: temp.path().join("Farmer").join("Farmer.so"),
            manifest_path: temp.path().join("Farmer").join("Farmer.deps.json"),
        };
        assert!(loader.load(&request).is_err());
    }
}
