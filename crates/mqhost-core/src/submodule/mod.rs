//! Submodule registry.
//!
//! Each running submodule moves through:
//!
//! ```text
//! Absent ──start_program──► Starting ──► Running ──try_stop_program──► CancelRequested
//!    ▲                         │            │                                │
//!    │        failure: unwind  │            │ stop_program / sweep           │ grace periods
//!    └─────────────────────────┴────────────┴────────────────────────────────┘
//!                                 Stopped: cancel, dispose operation, dispose
//!                                 program, dispose dependencies, unload module
//! ```

mod entry;
mod registry;

pub use entry::SubmoduleInfo;
pub use registry::{StopOutcome, SubmoduleRegistry};
