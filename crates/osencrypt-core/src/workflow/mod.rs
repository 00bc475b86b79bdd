//! Host workflows: mount reclaim, boot patching, the root pivot, and the
//! read-only status report.

mod boot;
mod diagnostics;
mod kernel;
mod patch_boot;
mod pivot;
mod reclaim;

pub use boot::{BootConfigPatcher, PatchStrategy};
pub use diagnostics::inspect;
pub use kernel::KernelCmdline;
pub use patch_boot::{PatchBootSystemState, PATCH_BOOT_SYSTEM_STATE};
pub use pivot::PivotSession;
pub use reclaim::MountReclaimer;

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowReport {
    /// Highest severity among the events; `Info` for an empty report.
    pub fn worst(&self) -> WorkflowLevel {
        self.events
            .iter()
            .map(|e| e.level)
            .max_by_key(|level| match level {
                WorkflowLevel::Info | WorkflowLevel::Success => 0,
                WorkflowLevel::Warn => 1,
                WorkflowLevel::Error => 2,
            })
            .unwrap_or(WorkflowLevel::Info)
    }
}

pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}
