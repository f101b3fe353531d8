//! Task entity, blockers, and history log.

use crate::ids::{BlockerId, ProjectId, TaskId, WorkerId};
use crate::status::{Priority, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of history entries kept per task; oldest are dropped.
pub const HISTORY_CAP: usize = 100;

/// A Task is a unit of trackable work with a lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Project this task belongs to.
    pub project_id: ProjectId,

    /// Short human-readable title. Opaque to the core.
    pub title: String,

    /// Longer description. Opaque to the core.
    pub description: String,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Urgency tier.
    pub priority: Priority,

    /// Worker currently assigned, if any. Weak reference: it must name a
    /// worker known to the supervisor at assignment time, but may go stale
    /// afterwards.
    pub assigned_worker: Option<WorkerId>,

    /// Tasks that must complete before this one can start. Deduplicated,
    /// insertion order preserved.
    pub dependencies: Vec<TaskId>,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task was last mutated.
    pub updated_at: DateTime<Utc>,

    /// Stamped on first entry into `in_progress`.
    pub started_at: Option<DateTime<Utc>>,

    /// Stamped on entry into `completed`.
    pub completed_at: Option<DateTime<Utc>>,

    /// Wall-clock time from start to completion, in milliseconds.
    pub actual_duration_ms: Option<i64>,

    /// Obstacles currently preventing progress.
    pub blockers: Vec<Blocker>,

    /// Append-only action log, capped at [`HISTORY_CAP`] entries.
    pub history: VecDeque<HistoryEntry>,
}

impl Task {
    /// Create a new Task from a spec. Dependencies are deduplicated while
    /// preserving insertion order.
    pub fn new(spec: TaskSpec) -> Self {
        let now = Utc::now();
        let mut dependencies: Vec<TaskId> = Vec::with_capacity(spec.dependencies.len());
        for dep in spec.dependencies {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        Self {
            id: TaskId::generate(),
            project_id: spec.project_id,
            title: spec.title,
            description: spec.description,
            status: TaskStatus::Pending,
            priority: spec.priority,
            assigned_worker: None,
            dependencies,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            actual_duration_ms: None,
            blockers: Vec::new(),
            history: VecDeque::new(),
        }
    }

    /// Append a history entry, dropping the oldest once the cap is reached.
    pub fn record(&mut self, action: impl Into<String>, detail: impl Into<String>) {
        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            action: action.into(),
            detail: detail.into(),
            at: Utc::now(),
        });
    }

    /// Find a blocker by id.
    pub fn blocker(&self, id: &BlockerId) -> Option<&Blocker> {
        self.blockers.iter().find(|b| &b.id == id)
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Input for creating a Task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Project the task belongs to.
    pub project_id: ProjectId,

    /// Short title.
    pub title: String,

    /// Longer description.
    #[serde(default)]
    pub description: String,

    /// Urgency tier.
    #[serde(default)]
    pub priority: Priority,

    /// Dependency task ids. Duplicates are dropped on creation.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
}

impl TaskSpec {
    /// Create a spec with defaults for everything but project and title.
    pub fn new(project_id: impl Into<ProjectId>, title: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            title: title.into(),
            description: String::new(),
            priority: Priority::default(),
            dependencies: Vec::new(),
        }
    }

    /// Builder method to set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder method to set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to add a dependency.
    pub fn with_dependency(mut self, dep: impl Into<TaskId>) -> Self {
        self.dependencies.push(dep.into());
        self
    }
}

/// A recorded obstacle preventing a task from progressing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blocker {
    /// Unique blocker identifier.
    pub id: BlockerId,

    /// What is blocking the task.
    pub description: String,

    /// Free-form classification ("dependency", "approval", ...). Opaque to
    /// the core.
    pub kind: String,

    /// When the blocker was recorded.
    pub created_at: DateTime<Utc>,
}

impl Blocker {
    /// Create a new Blocker.
    pub fn new(description: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: BlockerId::generate(),
            description: description.into(),
            kind: kind.into(),
            created_at: Utc::now(),
        }
    }
}

/// One entry in a task's bounded history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// What happened ("created", "status_changed", ...).
    pub action: String,

    /// Free-form detail.
    pub detail: String,

    /// When it happened.
    pub at: DateTime<Utc>,
}
