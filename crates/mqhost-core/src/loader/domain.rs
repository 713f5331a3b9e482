//! Module domains and the program instances created from them.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cleanup::panic_message;
use crate::error::{Error, Result};
use crate::program::{Dependencies, Program};

use super::abi::{ProgramConstructor, program_from_raw};
use super::lease::{LoadedModule, ModuleFuture, ModuleLease};
use super::resolve::ResolvedDependency;

/// Factory for programs registered in-process.
pub type ProgramFactory = Arc<dyn Fn() -> Box<dyn Program> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Constructor {
    Native(ProgramConstructor),
    Static(ProgramFactory),
}

/// A program type exported by a module.
#[derive(Clone)]
pub struct ProgramType {
    type_name: String,
    constructor: Option<Constructor>,
}

impl ProgramType {
    pub(crate) fn new(type_name: String, constructor: Option<Constructor>) -> Self {
        Self {
            type_name,
            constructor,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn has_constructor(&self) -> bool {
        self.constructor.is_some()
    }

    /// Construct an instance that keeps `lease` alive.
    pub fn instantiate(&self, lease: ModuleLease) -> Result<ProgramInstance> {
        let Some(constructor) = &self.constructor else {
            return Err(Error::MissingConstructor {
                type_name: self.type_name.clone(),
            });
        };

        let program = match constructor {
            Constructor::Native(construct) => {
                // SAFETY: the constructor comes from a manifest whose ABI and
                // runtime versions were checked at load time, and the library
                // stays loaded for as long as `lease` lives.
                let raw = unsafe { construct() };
                if raw.is_null() {
                    return Err(Error::Execution(format!(
                        "constructor of {} failed",
                        self.type_name
                    )));
                }
                // SAFETY: non-null results of a manifest constructor come from
                // `into_raw_program`.
                unsafe { program_from_raw(raw) }
            }
            Constructor::Static(factory) => catch_unwind(AssertUnwindSafe(|| factory()))
                .map_err(|payload| {
                    Error::Execution(format!(
                        "constructor of {} panicked: {}",
                        self.type_name,
                        panic_message(payload.as_ref())
                    ))
                })?,
        };

        Ok(ProgramInstance {
            type_name: self.type_name.clone(),
            program: Mutex::new(Some(program)),
            lease,
        })
    }
}

impl std::fmt::Debug for ProgramType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramType")
            .field("type_name", &self.type_name)
            .field("has_constructor", &self.has_constructor())
            .finish()
    }
}

/// A constructed program.
///
/// The program is dropped before the lease so its code is still mapped
/// while its destructor runs.
pub struct ProgramInstance {
    type_name: String,
    // Programs are only `Send`; the mutex makes the instance shareable.
    program: Mutex<Option<Box<dyn Program>>>,
    lease: ModuleLease,
}

impl ProgramInstance {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Start the program's operation.
    pub fn run(
        &mut self,
        args: Vec<String>,
        deps: Dependencies,
        cancel: CancellationToken,
    ) -> Result<ModuleFuture> {
        let program = self
            .program
            .get_mut()
            .as_mut()
            .ok_or(Error::Disposed("ProgramInstance"))?;

        let future = catch_unwind(AssertUnwindSafe(|| program.run(args, deps, cancel)))
            .map_err(|payload| {
                Error::Execution(format!(
                    "{} panicked in run: {}",
                    self.type_name,
                    panic_message(payload.as_ref())
                ))
            })?;

        Ok(ModuleFuture::new(future, self.lease.clone()))
    }

    /// Call the program's dispose hook and drop it. Later calls are no-ops.
    pub fn dispose(&mut self) -> Result<()> {
        let Some(mut program) = self.program.get_mut().take() else {
            return Ok(());
        };

        let disposed = catch_unwind(AssertUnwindSafe(|| {
            program.dispose();
            drop(program);
        }));

        disposed.map_err(|payload| {
            Error::Execution(format!(
                "{} panicked in dispose: {}",
                self.type_name,
                panic_message(payload.as_ref())
            ))
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.program.lock().is_none()
    }
}

/// Result of unloading a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// The libraries were closed.
    Reclaimed,
    /// Instances, futures or handlers still hold the libraries; they close
    /// when the last of them drops.
    Deferred { live_references: usize },
}

/// Loading boundary for one submodule's code and private dependencies.
pub struct ModuleDomain {
    name: String,
    module_path: PathBuf,
    programs: Vec<ProgramType>,
    dependencies: Vec<ResolvedDependency>,
    module: Option<Arc<LoadedModule>>,
}

impl ModuleDomain {
    pub(crate) fn new(
        name: String,
        module_path: PathBuf,
        programs: Vec<ProgramType>,
        dependencies: Vec<ResolvedDependency>,
        module: Option<Arc<LoadedModule>>,
    ) -> Self {
        Self {
            name,
            module_path,
            programs,
            dependencies,
            module,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    pub fn programs(&self) -> &[ProgramType] {
        &self.programs
    }

    pub fn dependencies(&self) -> &[ResolvedDependency] {
        &self.dependencies
    }

    /// A lease that keeps this domain's libraries loaded.
    pub fn lease(&self) -> ModuleLease {
        ModuleLease::new(self.module.clone())
    }

    /// Pick the program type to run for `name`.
    ///
    /// Prefers a type whose name contains `name` and falls back to the first
    /// exported type.
    pub fn select_program(&self, name: &str) -> Result<&ProgramType> {
        tracing::info!(
            "Found {} program types in {}: {}",
            self.programs.len(),
            self.name,
            self.programs
                .iter()
                .map(ProgramType::type_name)
                .collect::<Vec<_>>()
                .join(", ")
        );

        if let Some(program) = self.programs.iter().find(|p| p.type_name.contains(name)) {
            return Ok(program);
        }

        let first = self
            .programs
            .first()
            .ok_or_else(|| Error::MissingProgramContract {
                module: self.name.clone(),
            })?;

        tracing::warn!(
            "No program type named like {}, falling back to {}",
            name,
            first.type_name
        );
        Ok(first)
    }

    /// Release the domain's own hold on its libraries.
    pub fn unload(mut self) -> UnloadOutcome {
        let Some(module) = self.module.take() else {
            return UnloadOutcome::Reclaimed;
        };

        let live_references = Arc::strong_count(&module) - 1;
        drop(module);

        if live_references == 0 {
            tracing::info!("Unloaded module {}", self.name);
            UnloadOutcome::Reclaimed
        } else {
            tracing::info!(
                "Unload of {} deferred, {} live references",
                self.name,
                live_references
            );
            UnloadOutcome::Deferred { live_references }
        }
    }
}

impl std::fmt::Debug for ModuleDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDomain")
            .field("name", &self.name)
            .field("module_path", &self.module_path)
            .field("programs", &self.programs)
            .field("loaded", &self.module.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use futures::future::BoxFuture;

    #[derive(Default)]
    struct Foo;

    impl Program for Foo {
        fn run(
            &mut self,
            _args: Vec<String>,
            _deps: Dependencies,
            _cancel: CancellationToken,
        ) -> BoxFuture<'static, anyhow::Result<()>> {
            async { Ok(()) }.boxed()
        }
    }

    fn static_type(name: &str) -> ProgramType {
        ProgramType::new(
            name.to_string(),
            Some(Constructor::Static(Arc::new(|| Box::new(Foo) as Box<dyn Program>))),
        )
    }

    fn domain(programs: Vec<ProgramType>) -> ModuleDomain {
        ModuleDomain::new(
            "Foo".to_string(),
            PathBuf::from("Programs/Foo/Foo.so"),
            programs,
            Vec::new(),
            None,
        )
    }

    #[test]
    fn test_select_prefers_name_match() {
        let domain = domain(vec![static_type("Helper"), static_type("FooProgram")]);
        assert_eq!(domain.select_program("Foo").unwrap().type_name(), "FooProgram");
    }

    #[test]
    fn test_select_falls_back_to_first() {
        let domain = domain(vec![static_type("Helper"), static_type("Other")]);
        assert_eq!(domain.select_program("Foo").unwrap().type_name(), "Helper");
    }

    #[test]
    fn test_select_without_programs() {
        let domain = domain(Vec::new());
        assert!(matches!(
            domain.select_program("Foo"),
            Err(Error::MissingProgramContract { .. })
        ));
    }

    #[test]
    fn test_missing_constructor() {
        let program = ProgramType::new("Foo".to_string(), None);
        assert!(matches!(
            program.instantiate(ModuleLease::default()),
            Err(Error::MissingConstructor { .. })
        ));
    }

    #[test]
    fn test_panicking_factory() {
        let program = ProgramType::new(
            "Foo".to_string(),
            Some(Constructor::Static(Arc::new(|| -> Box<dyn Program> {
                panic!("no")
            }))),
        );
        assert!(matches!(
            program.instantiate(ModuleLease::default()),
            Err(Error::Execution(_))
        ));
    }

    #[test]
    fn test_dispose_twice() {
        let mut instance = static_type("Foo")
            .instantiate(ModuleLease::default())
            .unwrap();
        assert!(instance.dispose().is_ok());
        assert!(instance.is_disposed());
        assert!(instance.dispose().is_ok());
    }

    #[test]
    fn test_unload_in_process_domain() {
        assert_eq!(domain(Vec::new()).unload(), UnloadOutcome::Reclaimed);
    }
}
