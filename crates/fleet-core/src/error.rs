//! Core domain errors.

use crate::ids::{BlockerId, MessageId, ProjectId, TaskId, WorkerId};
use crate::status::TaskStatus;
use crate::worker::WorkerKind;
use thiserror::Error;

/// Core domain errors for Fleet.
///
/// Synchronous-facing operations fail with one of these and leave state
/// unchanged; failures inside a running worker are converted into a worker
/// status of `error` and re-emitted as an event instead of propagating.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Status change not permitted by the task transition table.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// A worker with this (project, kind) key is already starting or running.
    #[error("worker already running for project '{project}' kind '{kind}'")]
    AlreadyRunning { project: ProjectId, kind: WorkerKind },

    /// Task not found.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Worker not found in the registry.
    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    /// Message not found on the bus.
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// Blocker not found on the task.
    #[error("blocker not found: {0}")]
    BlockerNotFound(BlockerId),

    /// No constructor registered for the requested worker kind.
    #[error("unknown worker kind: {0}")]
    UnknownWorkerKind(String),

    /// Operation requires the worker to be in status `running`.
    #[error("worker {0} is not running")]
    NotRunning(WorkerId),

    /// Failure surfacing from a worker's initialization or main loop.
    #[error("worker failure: {0}")]
    Worker(String),

    /// Worker did not exit within the termination grace period.
    #[error("worker did not exit within {0} seconds, terminated forcibly")]
    Timeout(u64),
}

impl CoreError {
    /// Shorthand for wrapping a worker-side failure message.
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }
}
