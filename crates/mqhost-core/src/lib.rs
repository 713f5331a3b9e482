//! Core runtime for MQHost submodules.
//!
//! This crate provides:
//! - Cooperative execution context serializing every call into the host
//! - Isolated module loading with shared dependency resolution
//! - Submodule registry with exactly-once start and stop
//! - Command registry for sync and async textual commands
//! - Host lifecycle events and chat wait helpers
//! - The plugin host wiring all of the above to host callbacks

pub mod cleanup;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod host;
pub mod loader;
pub mod logging;
pub mod paths;
pub mod plugin;
pub mod program;
pub mod submodule;

pub use command::{CommandRegistry, SubmoduleCommands, split_arguments};
pub use config::{HostConfig, LoggingConfig, StopConfig};
pub use context::{
    ExecutionContext, OperationCancelled, TaskFault, TaskHandle, TaskStatus, delay,
};
pub use error::{Error, Result};
pub use events::{
    ChatChannel, ChatLine, ChatSource, ChatWaiter, EventHub, EventSubscription, GameState,
    HostEvent, SubmoduleEvents,
};
pub use host::{HostHandle, HostSurface, MessageSource};
pub use loader::{
    DylibLoader, LoadRequest, ModuleDomain, ModuleLoader, ModuleScope, StaticModuleLoader,
    UnloadOutcome,
};
pub use paths::HostDirs;
pub use plugin::{PluginHost, PluginHostBuilder};
pub use program::{Dependencies, Program};
pub use submodule::{StopOutcome, SubmoduleInfo, SubmoduleRegistry};

// Re-exported for submodule authors, whose programs return these types.
pub use futures::future::BoxFuture;
pub use tokio_util::sync::CancellationToken;
