//! Error types for mqhost-core.

use thiserror::Error;

/// Result type for mqhost-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mqhost-core.
///
/// Expected failures (a program file that does not exist, a program that is
/// already running) are not errors; the registries report them as `Ok(false)`
/// or `None` and log them. The variants here are programmer errors, use of a
/// disposed component, or failures surfaced from the platform.
#[derive(Debug, Error)]
pub enum Error {
    /// The component was already disposed.
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// The operation is not supported by this component.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A command with the same name is already registered.
    #[error("a command is already registered with the name: {0}")]
    DuplicateCommand(String),

    /// A submodule, program or command name was empty or whitespace.
    #[error("invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    /// The loaded module does not expose a usable program type.
    #[error("no program type found in module {module}")]
    MissingProgramContract { module: String },

    /// The selected program type cannot be constructed without arguments.
    #[error("program type {type_name} has no zero-argument constructor")]
    MissingConstructor { type_name: String },

    /// The module manifest is malformed or has an unexpected ABI version.
    #[error("invalid module ABI in {module}: {message}")]
    ModuleAbi { module: String, message: String },

    /// A shared dependency of a module could not be bound.
    #[error("unable to resolve dependency {dependency} for module {module}")]
    DependencyUnresolved { module: String, dependency: String },

    /// Failed to load dynamic library.
    #[error("failed to load library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The host rejected or failed a call through its surface.
    #[error("host error: {0}")]
    Host(String),

    /// Execution error.
    #[error("execution error: {0}")]
    Execution(String),
}

impl Error {
    /// Whether this error signals a programming mistake rather than a runtime condition.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateCommand(_)
                | Self::InvalidName { .. }
                | Self::MissingProgramContract { .. }
                | Self::MissingConstructor { .. }
        )
    }
}
