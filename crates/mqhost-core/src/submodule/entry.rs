//! One running submodule and its teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cleanup::{Teardown, guarded, guarded_infallible};
use crate::context::{TaskHandle, TaskStatus};
use crate::loader::{ModuleDomain, ProgramInstance, UnloadOutcome};
use crate::program::Dependencies;

/// Read-only view of a running submodule.
#[derive(Debug, Clone)]
pub struct SubmoduleInfo {
    pub name: String,
    /// Identifies this start; a restart under the same name gets a new one.
    pub start_id: Uuid,
    pub program_type: String,
    pub started_at: Instant,
    pub status: TaskStatus,
    pub cancel_requested: bool,
}

/// Everything created when a submodule starts.
///
/// Fields are filled in as the start progresses, so a failed start tears
/// down exactly what was created. Teardown runs once; `Drop` runs it
/// silently if nobody did.
pub(crate) struct SubmoduleEntry {
    pub(crate) name: String,
    pub(crate) id: Uuid,
    pub(crate) program_type: String,
    pub(crate) started_at: Instant,
    pub(crate) cancel: CancellationToken,
    cancel_requested: AtomicBool,
    pub(crate) task: Option<TaskHandle>,
    pub(crate) instance: Option<ProgramInstance>,
    pub(crate) deps: Option<Dependencies>,
    pub(crate) domain: Option<ModuleDomain>,
    torn_down: bool,
}

impl SubmoduleEntry {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            id: Uuid::new_v4(),
            program_type: String::new(),
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            cancel_requested: AtomicBool::new(false),
            task: None,
            instance: None,
            deps: None,
            domain: None,
            torn_down: false,
        }
    }

    /// Status of the program's operation. An entry without one counts as completed.
    pub(crate) fn status(&self) -> TaskStatus {
        self.task
            .as_ref()
            .map(TaskHandle::status)
            .unwrap_or(TaskStatus::Completed)
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    pub(crate) fn info(&self) -> SubmoduleInfo {
        SubmoduleInfo {
            name: self.name.clone(),
            start_id: self.id,
            program_type: self.program_type.clone(),
            started_at: self.started_at,
            status: self.status(),
            cancel_requested: self.cancel_requested.load(Ordering::Acquire),
        }
    }

    /// Log the operation's outcome if it faulted, marking the fault observed.
    pub(crate) fn report_fault(&self) -> Option<String> {
        let task = self.task.as_ref()?;
        if task.status() != TaskStatus::Faulted {
            return None;
        }
        let message = task.take_error().map(|e| format!("{:#}", e))?;
        tracing::error!("Program {} faulted: {}", self.name, message);
        Some(message)
    }

    /// Cancel, drop the operation, dispose the program and its dependencies,
    /// then unload the module. Every step runs even if an earlier one fails.
    pub(crate) fn teardown(&mut self, mode: Teardown) -> Option<UnloadOutcome> {
        if self.torn_down {
            return None;
        }
        self.torn_down = true;

        let name = self.name.clone();

        let cancel = self.cancel.clone();
        guarded_infallible("cancel", &name, mode, move || cancel.cancel());

        if let Some(task) = self.task.take() {
            guarded_infallible("dispose operation", &name, mode, move || task.dispose());
        }

        if let Some(mut instance) = self.instance.take() {
            guarded("dispose program", &name, mode, move || instance.dispose());
        }

        if let Some(deps) = self.deps.take() {
            guarded_infallible("dispose dependencies", &name, mode, move || deps.dispose());
        }

        let mut outcome = None;
        if let Some(domain) = self.domain.take() {
            guarded_infallible("unload module", &name, mode, || {
                outcome = Some(domain.unload());
            });
        }

        if mode == Teardown::Logged {
            tracing::info!("Submodule {} torn down ({:?})", name, outcome);
        }
        outcome
    }
}

impl Drop for SubmoduleEntry {
    fn drop(&mut self) {
        self.teardown(Teardown::Silent);
    }
}
