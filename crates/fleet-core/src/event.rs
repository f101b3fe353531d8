//! Domain events emitted by workers and relayed by the supervisor.

use crate::ids::{MessageId, ProjectId, TaskId, WorkerId};
use crate::status::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a worker log event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// The closed set of domain events a worker may emit.
///
/// The supervisor relays these verbatim; it never interprets or validates
/// their contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Free-form log line.
    Log { level: LogLevel, message: String },
    /// Worker-reported activity state; doubles as a heartbeat.
    StatusUpdate { state: String },
    /// The worker finished a task.
    TaskCompleted { task_id: TaskId },
    /// The worker handled an inbound message.
    MessageProcessed { message_id: MessageId },
    /// Non-fatal error surfaced by the worker's own logic.
    Error { message: String },
    /// Free-form reasoning trace.
    Thought { text: String },
    /// A decision the worker committed to.
    Decision { text: String },
    /// Planning output.
    Planning { text: String },
    /// A file the worker touched.
    FileOperation { path: String, action: String },
    /// The worker observed or requested a task status change.
    TaskStateChange {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// The worker sent a message to a peer.
    OutboundMessage { to: WorkerId, kind: String },
    /// A test run the worker performed.
    TestExecution { command: String, passed: bool },
    /// A review the worker performed.
    CodeReview { target: String, verdict: String },
}

impl WorkerEvent {
    /// Create an info-level log event.
    pub fn info(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    /// Create a log event at an explicit level.
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            level,
            message: message.into(),
        }
    }

    /// Create an error event.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Create a reasoning-trace event.
    pub fn thought(text: impl Into<String>) -> Self {
        Self::Thought { text: text.into() }
    }

    /// Stable name of the variant, used for metrics and logging.
    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Log { .. } => "log",
            WorkerEvent::StatusUpdate { .. } => "status_update",
            WorkerEvent::TaskCompleted { .. } => "task_completed",
            WorkerEvent::MessageProcessed { .. } => "message_processed",
            WorkerEvent::Error { .. } => "error",
            WorkerEvent::Thought { .. } => "thought",
            WorkerEvent::Decision { .. } => "decision",
            WorkerEvent::Planning { .. } => "planning",
            WorkerEvent::FileOperation { .. } => "file_operation",
            WorkerEvent::TaskStateChange { .. } => "task_state_change",
            WorkerEvent::OutboundMessage { .. } => "outbound_message",
            WorkerEvent::TestExecution { .. } => "test_execution",
            WorkerEvent::CodeReview { .. } => "code_review",
        }
    }
}

/// A worker event stamped with its origin, as relayed on the supervisor's
/// outbound stream. The payload is carried unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Worker that emitted the event.
    pub worker_id: WorkerId,

    /// Project the worker belongs to.
    pub project_id: ProjectId,

    /// When the supervisor relayed the event.
    pub at: DateTime<Utc>,

    /// The event itself, verbatim.
    pub event: WorkerEvent,
}

impl EventEnvelope {
    /// Stamp an event with its origin and the current time.
    pub fn stamp(worker_id: WorkerId, project_id: ProjectId, event: WorkerEvent) -> Self {
        Self {
            worker_id,
            project_id,
            at: Utc::now(),
            event,
        }
    }
}
