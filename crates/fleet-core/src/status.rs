//! Status enums for Tasks, Workers, and Messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created but not yet picked up.
    #[default]
    Pending,
    /// Task is being broken down before execution.
    Planning,
    /// Task is actively being worked on.
    InProgress,
    /// Work finished, awaiting review.
    Review,
    /// Work under test.
    Testing,
    /// Task cannot progress until its blockers are cleared.
    Blocked,
    /// Task finished successfully. Terminal.
    Completed,
    /// Task failed; may be retried via pending/planning.
    Failed,
}

impl TaskStatus {
    /// The statuses reachable from this one.
    ///
    /// This table is exhaustive; `Completed` is terminal and `Failed` only
    /// re-enters through the retry path.
    pub fn successors(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Pending => &[Planning, InProgress, Blocked, Failed],
            Planning => &[InProgress, Blocked, Failed, Pending],
            InProgress => &[Review, Testing, Blocked, Failed, Completed],
            Review => &[InProgress, Testing, Blocked, Failed],
            Testing => &[InProgress, Completed, Failed, Blocked],
            Blocked => &[Pending, Planning, InProgress, Failed],
            Completed => &[],
            Failed => &[Pending, Planning],
        }
    }

    /// Returns true if `to` is reachable from this status in one step.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        self.successors().contains(&to)
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Testing => "testing",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::Planning,
        TaskStatus::InProgress,
        TaskStatus::Review,
        TaskStatus::Testing,
        TaskStatus::Blocked,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a supervised Worker runtime record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Record registered, initialization in flight.
    #[default]
    Starting,
    /// Worker initialized and running its event loop.
    Running,
    /// Shutdown requested, worker winding down.
    Stopping,
    /// Worker exited cleanly. Terminal.
    Stopped,
    /// Worker initialization or main loop failed. Terminal.
    Error,
}

impl WorkerStatus {
    /// Returns true if the worker is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Error => "error",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority tier used for both task urgency and message delivery ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Drained before everything else.
    Critical,
    /// Above normal traffic.
    High,
    #[default]
    Normal,
    /// Background traffic, drained last.
    Low,
}

impl Priority {
    /// Delivery order: every critical message drains before any high, etc.
    pub const TIERS: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of a Message owned by the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Queued, not yet handed to the recipient.
    #[default]
    Pending,
    /// Handed to the recipient, awaiting acknowledgement.
    Delivered,
    /// Acknowledged by the recipient; the bus drops it.
    Consumed,
}
