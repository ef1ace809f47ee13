//! Mount and unmount state machines plus the reporting types shared by
//! bottle-level workflows.

mod mount;
mod privilege;
mod unmount;


pub use mount::MountOrchestrator;
pub use privilege::{ensure_privilege_support, running_as_root, Escalator};
pub use unmount::{LockRetry, UnmountOrchestrator};

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Security,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by create/delete/status workflows.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}
