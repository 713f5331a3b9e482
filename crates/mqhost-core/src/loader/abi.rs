//! Module ABI shared by the host and submodule libraries.
//!
//! A submodule library exports one symbol, `mqhost_program_manifest`, that
//! returns a pointer to a static [`ProgramManifest`]. Submodule authors
//! generate it with [`declare_programs!`](crate::declare_programs):
//!
//! ```ignore
//! #[derive(Default)]
//! struct Farmer;
//!
//! impl mqhost_core::Program for Farmer { /* ... */ }
//!
//! mqhost_core::declare_programs!(Farmer);
//! ```
//!
//! Program instances cross the boundary as `Box<Box<dyn Program>>`, so the
//! library must be built by the same compiler against the same `mqhost-core`
//! version as the host; the manifest carries both versions for checking.
//!
//! The library keeps its own copy of every dependency. Each exported program
//! is wrapped in [`ExportedProgram`], which runs the program's code inside
//! the [`ModuleScope`] of its dependencies: the library's copy then sees the
//! host's execution context and logs through the host's subscriber, and its
//! panics are caught on its own side of the boundary.

use std::ffi::{c_char, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::cleanup::panic_message;
use crate::program::{Dependencies, Program};

use super::boundary::ModuleScope;

/// Version of the manifest layout.
pub const PROGRAM_ABI_VERSION: u32 = 1;

/// Symbol exported by every submodule library.
pub const MANIFEST_SYMBOL: &[u8] = b"mqhost_program_manifest";

/// Version of this runtime, compared against the manifest's `runtime_version`.
pub const RUNTIME_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

/// Creates a program instance; returns null on failure.
pub type ProgramConstructor = unsafe extern "C" fn() -> *mut c_void;

/// Signature of `mqhost_program_manifest`.
pub type ManifestFn = unsafe extern "C" fn() -> *const ProgramManifest;

/// One program type exported by a library.
#[repr(C)]
pub struct ProgramEntry {
    /// NUL-terminated type name.
    pub type_name: *const c_char,
    /// Zero-argument constructor, if the type has one.
    pub constructor: Option<ProgramConstructor>,
}

/// Table of program types exported by a library.
#[repr(C)]
pub struct ProgramManifest {
    pub abi_version: u32,
    /// NUL-terminated `mqhost-core` version the library was built against.
    pub runtime_version: *const c_char,
    pub count: usize,
    pub entries: *const ProgramEntry,
}

// SAFETY: manifests only point at static, immutable data.
unsafe impl Sync for ProgramEntry {}
unsafe impl Sync for ProgramManifest {}

/// Box a program for transfer to the host.
pub fn into_raw_program(program: Box<dyn Program>) -> *mut c_void {
    Box::into_raw(Box::new(program)).cast::<c_void>()
}

/// Take back a program produced by [`into_raw_program`].
///
/// # Safety
/// `raw` must come from [`into_raw_program`] and not have been taken before.
pub unsafe fn program_from_raw(raw: *mut c_void) -> Box<dyn Program> {
    // SAFETY: per the caller's contract.
    *unsafe { Box::from_raw(raw.cast::<Box<dyn Program>>()) }
}

/// A program running its code inside the scope of its dependencies.
pub struct ExportedProgram<P> {
    program: Option<P>,
    scope: Option<ModuleScope>,
}

impl<P: Program> ExportedProgram<P> {
    pub fn new(program: P) -> Self {
        Self {
            program: Some(program),
            scope: None,
        }
    }

    fn guarded(&self, what: &str, f: impl FnOnce() -> anyhow::Result<()>) {
        let result = match &self.scope {
            Some(scope) => scope.call(what, f),
            None => catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
                Err(anyhow::anyhow!(
                    "panicked in {}: {}",
                    what,
                    panic_message(payload.as_ref())
                ))
            }),
        };

        if let Err(e) = result {
            match &self.scope {
                Some(scope) => scope.enter(|| tracing::error!("{:#}", e)),
                None => tracing::error!("{:#}", e),
            }
        }
    }
}

impl<P: Program> Program for ExportedProgram<P> {
    fn run(
        &mut self,
        args: Vec<String>,
        deps: Dependencies,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        let scope = deps.scope().clone();
        self.scope = Some(scope.clone());

        let Some(program) = self.program.as_mut() else {
            return futures::future::ready(Err(anyhow::anyhow!("program already disposed"))).boxed();
        };

        match scope.call("run", || Ok(program.run(args, deps, cancel))) {
            Ok(future) => scope.guard(future),
            Err(e) => futures::future::ready(Err(e)).boxed(),
        }
    }

    fn dispose(&mut self) {
        let Some(mut program) = self.program.take() else {
            return;
        };
        self.guarded("dispose", move || {
            program.dispose();
            drop(program);
            Ok(())
        });
    }
}

impl<P> Drop for ExportedProgram<P> {
    fn drop(&mut self) {
        let Some(program) = self.program.take() else {
            return;
        };
        let release = move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(move || drop(program))) {
                tracing::error!("Dropping a program panicked: {}", panic_message(payload.as_ref()));
            }
        };
        match &self.scope {
            Some(scope) => scope.enter(release),
            None => release(),
        }
    }
}

/// Zero-argument constructor for `P`. Panics are caught and reported as null.
///
/// # Safety
/// Safe to call; `unsafe` only to match [`ProgramConstructor`].
pub unsafe extern "C" fn construct_program<P: Program + Default>() -> *mut c_void {
    let constructed = catch_unwind(AssertUnwindSafe(|| {
        into_raw_program(Box::new(ExportedProgram::new(P::default())))
    }));
    constructed.unwrap_or(std::ptr::null_mut())
}

/// Export the program manifest of a submodule library.
///
/// Every listed type must implement [`Program`](crate::Program) and
/// [`Default`].
#[macro_export]
macro_rules! declare_programs {
    ($($program:ty),+ $(,)?) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn mqhost_program_manifest() -> *const $crate::loader::abi::ProgramManifest {
            const ENTRIES: &[$crate::loader::abi::ProgramEntry] = &[
                $(
                    $crate::loader::abi::ProgramEntry {
                        type_name: concat!(stringify!($program), "\0").as_ptr().cast(),
                        constructor: Some($crate::loader::abi::construct_program::<$program>),
                    },
                )+
            ];

            static MANIFEST: $crate::loader::abi::ProgramManifest =
                $crate::loader::abi::ProgramManifest {
                    abi_version: $crate::loader::abi::PROGRAM_ABI_VERSION,
                    runtime_version: $crate::loader::abi::RUNTIME_VERSION.as_ptr().cast(),
                    count: ENTRIES.len(),
                    entries: ENTRIES.as_ptr(),
                };

            &MANIFEST
        }
    };
}
