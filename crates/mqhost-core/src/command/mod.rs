//! Command registry.
//!
//! Submodules expose named textual commands (`/name args...`) to the host.
//! The host dispatches by name through [`CommandRegistry::invoke`]; the
//! registered trampoline splits the argument buffer and runs the handler
//! inside the execution context:
//!
//! ```text
//! host ──/cmd a "b c"──► invoke ──► trampoline ──► split ──► run_with_context
//!                                                              │
//!                          sync:  in-progress check ─► handler ┘
//!                          async: child token ─► spawn ─► AsyncCommandTask
//! ```

mod args;
mod facade;
mod registry;

pub use args::split_arguments;
pub use facade::SubmoduleCommands;
pub use registry::{
    AsyncCommandHandler, AsyncCommandTask, CommandHandler, CommandRegistry,
    normalize_command_name,
};
