//! Task store - the state machine over task lifecycles.
//!
//! All mutations are synchronous and complete without suspension; the lock is
//! never held across an await point. Mutation events are published on a
//! broadcast channel for the presentation layer.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use fleet_core::{
    Blocker, BlockerId, CoreError, ProjectId, Task, TaskId, TaskSpec, TaskStatus, WorkerId,
};

/// Capacity of the mutation event channel; slow subscribers lag, they do not
/// block mutations.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Aggregated task metrics, updated incrementally on mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct TaskMetrics {
    /// Tasks ever created.
    pub total_created: u64,
    /// Tasks that reached `completed`.
    pub total_completed: u64,
    /// Times any task entered `failed`.
    pub total_failed: u64,
    /// Running mean of completion wall-clock time in milliseconds.
    pub average_completion_ms: f64,
}

/// A mutation that happened inside the store.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task was created.
    Created {
        task_id: TaskId,
        project_id: ProjectId,
    },
    /// A task moved along the transition table.
    StatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// A task was assigned to a worker.
    Assigned {
        task_id: TaskId,
        worker_id: WorkerId,
        previous: Option<WorkerId>,
    },
    /// A blocker was recorded on a task.
    BlockerAdded {
        task_id: TaskId,
        blocker_id: BlockerId,
    },
    /// A blocker was cleared from a task.
    BlockerRemoved {
        task_id: TaskId,
        blocker_id: BlockerId,
    },
}

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<TaskId, Task>,
    // worker -> tasks currently assigned to it
    by_worker: HashMap<WorkerId, BTreeSet<TaskId>>,
    metrics: TaskMetrics,
}

impl StoreInner {
    /// Apply a validated status transition. Leaves the task untouched and
    /// returns `InvalidTransition` when the table forbids the move.
    fn apply_status(
        &mut self,
        task_id: &TaskId,
        new_status: TaskStatus,
        details: Option<&str>,
    ) -> Result<TaskEvent, CoreError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.clone()))?;

        let from = task.status;
        if !from.can_transition_to(new_status) {
            warn!(task_id = %task_id, from = %from, to = %new_status, "Invalid status transition rejected");
            return Err(CoreError::InvalidTransition {
                from,
                to: new_status,
            });
        }

        let now = Utc::now();
        task.status = new_status;
        task.updated_at = now;

        match new_status {
            TaskStatus::InProgress => {
                if task.started_at.is_none() {
                    task.started_at = Some(now);
                }
            }
            TaskStatus::Completed => {
                task.completed_at = Some(now);
                let actual_ms = task
                    .started_at
                    .map(|started| (now - started).num_milliseconds())
                    .unwrap_or(0);
                task.actual_duration_ms = Some(actual_ms);

                let metrics = &mut self.metrics;
                metrics.total_completed += 1;
                let count = metrics.total_completed as f64;
                metrics.average_completion_ms +=
                    (actual_ms as f64 - metrics.average_completion_ms) / count;
            }
            TaskStatus::Failed => {
                self.metrics.total_failed += 1;
            }
            _ => {}
        }

        let task = self.tasks.get_mut(task_id).expect("present above");
        let detail = match details {
            Some(details) => format!("{from} -> {new_status}: {details}"),
            None => format!("{from} -> {new_status}"),
        };
        task.record("status_changed", detail);

        Ok(TaskEvent::StatusChanged {
            task_id: task_id.clone(),
            from,
            to: new_status,
        })
    }
}

/// In-memory task store. Cheap to share via `Arc`; all methods take `&self`.
pub struct TaskStore {
    inner: RwLock<StoreInner>,
    events: broadcast::Sender<TaskEvent>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(StoreInner::default()),
            events,
        }
    }

    /// Subscribe to mutation events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Create a task from a spec. Always succeeds.
    pub fn create_task(&self, spec: TaskSpec) -> Task {
        let mut task = Task::new(spec);
        let title = task.title.clone();
        task.record("created", title);

        let event = TaskEvent::Created {
            task_id: task.id.clone(),
            project_id: task.project_id.clone(),
        };

        {
            let mut inner = self.inner.write().expect("store lock poisoned");
            inner.metrics.total_created += 1;
            inner.tasks.insert(task.id.clone(), task.clone());
        }

        info!(task_id = %task.id, project_id = %task.project_id, title = %task.title, "Task created");
        self.publish(event);
        task
    }

    /// Move a task to `new_status`, validating against the transition table.
    ///
    /// On violation fails with [`CoreError::InvalidTransition`] and leaves
    /// the task unchanged. On success stamps timestamps, updates metrics, and
    /// appends a history entry.
    pub fn update_status(
        &self,
        task_id: &TaskId,
        new_status: TaskStatus,
        details: Option<&str>,
    ) -> Result<Task, CoreError> {
        let (event, snapshot) = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            let event = inner.apply_status(task_id, new_status, details)?;
            let snapshot = inner.tasks[task_id].clone();
            (event, snapshot)
        };

        info!(task_id = %task_id, status = %snapshot.status, "Task status updated");
        self.publish(event);
        Ok(snapshot)
    }

    /// Assign a task to a worker, maintaining the worker -> tasks index.
    ///
    /// The caller is responsible for only naming workers the supervisor
    /// knows; the reference is weak and tolerated stale afterwards.
    pub fn assign(&self, task_id: &TaskId, worker_id: &WorkerId) -> Result<(), CoreError> {
        let event = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            let task = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| CoreError::TaskNotFound(task_id.clone()))?;

            let previous = task.assigned_worker.replace(worker_id.clone());
            task.updated_at = Utc::now();
            task.record("assigned", worker_id.as_str());

            if let Some(previous_worker) = &previous {
                if let Some(set) = inner.by_worker.get_mut(previous_worker) {
                    set.remove(task_id);
                    if set.is_empty() {
                        inner.by_worker.remove(previous_worker);
                    }
                }
            }
            inner
                .by_worker
                .entry(worker_id.clone())
                .or_default()
                .insert(task_id.clone());

            TaskEvent::Assigned {
                task_id: task_id.clone(),
                worker_id: worker_id.clone(),
                previous,
            }
        };

        info!(task_id = %task_id, worker_id = %worker_id, "Task assigned");
        self.publish(event);
        Ok(())
    }

    /// Record a blocker; forces the task into `blocked` through the validated
    /// transition path when it is not already there.
    pub fn add_blocker(&self, task_id: &TaskId, blocker: Blocker) -> Result<Task, CoreError> {
        let blocker_id = blocker.id.clone();
        let (status_event, snapshot) = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            let task = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| CoreError::TaskNotFound(task_id.clone()))?;

            // Validate before touching the blocker list so a rejected
            // transition leaves the task fully unchanged.
            let needs_transition = task.status != TaskStatus::Blocked;
            if needs_transition && !task.status.can_transition_to(TaskStatus::Blocked) {
                return Err(CoreError::InvalidTransition {
                    from: task.status,
                    to: TaskStatus::Blocked,
                });
            }

            task.record("blocker_added", &blocker.description);
            task.blockers.push(blocker);
            task.updated_at = Utc::now();

            let status_event = if needs_transition {
                Some(inner.apply_status(task_id, TaskStatus::Blocked, Some("blocker recorded"))?)
            } else {
                None
            };
            (status_event, inner.tasks[task_id].clone())
        };

        info!(task_id = %task_id, blocker_id = %blocker_id, "Blocker added");
        self.publish(TaskEvent::BlockerAdded {
            task_id: task_id.clone(),
            blocker_id,
        });
        if let Some(event) = status_event {
            self.publish(event);
        }
        Ok(snapshot)
    }

    /// Remove a blocker. When the last one goes and the task is `blocked`,
    /// it returns to `in_progress` if it had been started, else `pending`.
    pub fn remove_blocker(
        &self,
        task_id: &TaskId,
        blocker_id: &BlockerId,
    ) -> Result<Task, CoreError> {
        let (status_event, snapshot) = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            let task = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| CoreError::TaskNotFound(task_id.clone()))?;

            let index = task
                .blockers
                .iter()
                .position(|b| &b.id == blocker_id)
                .ok_or_else(|| CoreError::BlockerNotFound(blocker_id.clone()))?;
            let removed = task.blockers.remove(index);
            task.updated_at = Utc::now();
            task.record("blocker_removed", &removed.description);

            let unblock_to = if task.blockers.is_empty() && task.status == TaskStatus::Blocked {
                if task.started_at.is_some() {
                    Some(TaskStatus::InProgress)
                } else {
                    Some(TaskStatus::Pending)
                }
            } else {
                None
            };

            let status_event = match unblock_to {
                Some(to) => Some(inner.apply_status(task_id, to, Some("last blocker cleared"))?),
                None => None,
            };
            (status_event, inner.tasks[task_id].clone())
        };

        info!(task_id = %task_id, blocker_id = %blocker_id, "Blocker removed");
        self.publish(TaskEvent::BlockerRemoved {
            task_id: task_id.clone(),
            blocker_id: blocker_id.clone(),
        });
        if let Some(event) = status_event {
            self.publish(event);
        }
        Ok(snapshot)
    }

    /// True iff every dependency of the task is `completed`. Vacuously true
    /// for a task without dependencies. Unknown dependencies gate too.
    pub fn can_start(&self, task_id: &TaskId) -> Result<bool, CoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let task = inner
            .tasks
            .get(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.clone()))?;

        Ok(task.dependencies.iter().all(|dep| {
            inner
                .tasks
                .get(dep)
                .map(|d| d.status == TaskStatus::Completed)
                .unwrap_or(false)
        }))
    }

    /// Look up a single task.
    pub fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .tasks
            .get(task_id)
            .cloned()
    }

    /// All tasks currently in the given status.
    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// All tasks assigned to the given worker, in id order.
    pub fn tasks_by_worker(&self, worker_id: &WorkerId) -> Vec<Task> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .by_worker
            .get(worker_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All tasks belonging to the given project.
    pub fn project_tasks(&self, project_id: &ProjectId) -> Vec<Task> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .tasks
            .values()
            .filter(|t| &t.project_id == project_id)
            .cloned()
            .collect()
    }

    /// Every task in the store.
    pub fn all_tasks(&self) -> Vec<Task> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.tasks.values().cloned().collect()
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> TaskMetrics {
        self.inner.read().expect("store lock poisoned").metrics
    }

    fn publish(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
