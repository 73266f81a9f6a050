//! Error types for task construction and scheduling

use crate::task::{TaskId, TaskState};

/// Errors raised while building task graphs or driving the task state machine.
///
/// These are construction-time errors, reported synchronously to the caller.
/// Frame-time residency failures never surface here: they drop the affected
/// tasks and go to the diagnostics sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Adding the dependency would make the task (transitively) depend on itself
    #[error("task {task} cannot depend on {dependency}: {dependency} already requires {task}")]
    CyclicDependency { task: TaskId, dependency: TaskId },

    /// The task is not part of the graph or plan
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// The task was handed to the submission queue and can only be awaited
    #[error("task {0} was already submitted")]
    AlreadySubmitted(TaskId),

    /// The per-task state machine does not allow this move
    #[error("task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },
}
