//! Worker supervisor - lifecycle, registry, and event relay.
//!
//! The supervisor owns every worker instance outright: a worker is moved
//! into its runner task at launch and never seen again by callers. The
//! registry enforces at most one active worker per (project, kind) key with
//! an atomic insert-if-absent, and every domain event a worker emits is
//! relayed, stamped but otherwise untouched, onto a single outbound
//! broadcast stream.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fleet_core::{
    CoreError, EventEnvelope, MessageDraft, ProjectId, WorkerConfig, WorkerEvent, WorkerId,
    WorkerKind, WorkerStatus,
};

use crate::bus::MessageBus;
use crate::config::SupervisorConfig;
use crate::store::TaskStore;
use crate::worker::{Worker, WorkerContext, WorkerFactory};

/// Ring buffer caps for per-worker logs and errors.
const LOG_CAP: usize = 512;
const ERROR_CAP: usize = 128;

type RegistryKey = (ProjectId, WorkerKind);

/// Identifies one supervised worker across the API surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct WorkerKey {
    pub project_id: ProjectId,
    pub worker_id: WorkerId,
    pub kind: WorkerKind,
}

/// The three liveness buckets produced by a health check.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct HealthReport {
    /// Running with a fresh heartbeat.
    pub healthy: Vec<WorkerKey>,
    /// Registered but neither demonstrably alive nor terminal.
    pub unhealthy: Vec<WorkerKey>,
    /// In a terminal status, kept for inspection.
    pub stopped: Vec<WorkerKey>,
}

/// Events on the supervisor's aggregated outbound stream.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    /// A worker domain event, stamped with its origin.
    Worker(EventEnvelope),
    /// A worker record was registered.
    WorkerLaunched {
        project_id: ProjectId,
        worker_id: WorkerId,
        kind: WorkerKind,
    },
    /// A worker's registry status changed.
    WorkerStatusChanged {
        project_id: ProjectId,
        worker_id: WorkerId,
        status: WorkerStatus,
    },
    /// A worker wound down cleanly.
    WorkerStopped {
        project_id: ProjectId,
        worker_id: WorkerId,
    },
    /// A worker's initialization or main loop failed.
    WorkerFailed {
        project_id: ProjectId,
        worker_id: WorkerId,
        error: String,
    },
    /// The unhealthy bucket grew since the previous health sweep.
    HealthAlert { unhealthy: Vec<WorkerKey> },
}

/// Public view of one worker runtime record.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub project_id: ProjectId,
    pub kind: WorkerKind,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    pub messages_processed: u64,
    pub tasks_completed: u64,
    pub error_count: u64,
    pub restart_attempts: u32,
    pub last_error: Option<String>,
}

/// One worker's runtime record. Exclusively owned by the supervisor.
struct WorkerRecord {
    worker_id: WorkerId,
    project_id: ProjectId,
    kind: WorkerKind,
    config: WorkerConfig,
    status: WorkerStatus,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    last_heartbeat: DateTime<Utc>,
    logs: VecDeque<String>,
    errors: VecDeque<String>,
    messages_processed: u64,
    tasks_completed: u64,
    error_count: u64,
    restart_attempts: u32,
    direct_tx: Option<mpsc::Sender<fleet_core::Message>>,
    shutdown: CancellationToken,
    runner: Option<JoinHandle<()>>,
}

impl WorkerRecord {
    fn push_log(&mut self, line: String) {
        if self.logs.len() == LOG_CAP {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    fn push_error(&mut self, line: String) {
        if self.errors.len() == ERROR_CAP {
            self.errors.pop_front();
        }
        self.errors.push_back(line);
        self.error_count += 1;
    }

    fn key(&self) -> WorkerKey {
        WorkerKey {
            project_id: self.project_id.clone(),
            worker_id: self.worker_id.clone(),
            kind: self.kind,
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id.clone(),
            project_id: self.project_id.clone(),
            kind: self.kind,
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            last_heartbeat: self.last_heartbeat,
            messages_processed: self.messages_processed,
            tasks_completed: self.tasks_completed,
            error_count: self.error_count,
            restart_attempts: self.restart_attempts,
            last_error: self.errors.back().cloned(),
        }
    }
}

/// Supervises the fleet of workers for all projects.
pub struct Supervisor {
    registry: RwLock<HashMap<RegistryKey, WorkerRecord>>,
    factory: WorkerFactory,
    tasks: Option<Arc<TaskStore>>,
    bus: Option<Arc<MessageBus>>,
    events: broadcast::Sender<SupervisorEvent>,
    config: SupervisorConfig,
    // Handle to ourselves for spawning runner tasks; set by `new`.
    self_ref: Weak<Supervisor>,
}

impl Supervisor {
    /// Create a supervisor. Store and bus handles are optional; workers that
    /// need them simply see `None` when absent.
    pub fn new(
        factory: WorkerFactory,
        tasks: Option<Arc<TaskStore>>,
        bus: Option<Arc<MessageBus>>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.broadcast_capacity);
        Arc::new_cyclic(|self_ref| Self {
            registry: RwLock::new(HashMap::new()),
            factory,
            tasks,
            bus,
            events,
            config,
            self_ref: self_ref.clone(),
        })
    }

    /// A strong handle to ourselves. Always succeeds while any caller holds
    /// the supervisor, which a `&self` borrow implies.
    fn handle(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("supervisor dropped")
    }

    /// Subscribe to the aggregated outbound event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Launch a worker for (project, kind). Returns as soon as the record is
    /// registered; initialization and the event loop run asynchronously.
    ///
    /// Registration is an atomic insert-if-absent: a second launch for the
    /// same key while the first is active fails with `AlreadyRunning`.
    pub fn launch(
        &self,
        project_id: impl Into<ProjectId>,
        kind: WorkerKind,
        config: WorkerConfig,
    ) -> Result<WorkerId, CoreError> {
        self.launch_inner(project_id.into(), kind, config, 0)
    }

    fn launch_inner(
        &self,
        project_id: ProjectId,
        kind: WorkerKind,
        config: WorkerConfig,
        restart_attempts: u32,
    ) -> Result<WorkerId, CoreError> {
        let worker = self.factory.build(kind, &config)?;
        let direct_tx = worker.message_sender();

        let worker_id = WorkerId::generate();
        let shutdown = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(self.config.event_channel_capacity);
        let ctx = WorkerContext {
            project_id: project_id.clone(),
            worker_id: worker_id.clone(),
            config: config.clone(),
            events: events_tx,
            tasks: self.tasks.clone(),
            bus: self.bus.clone(),
            shutdown: shutdown.clone(),
        };

        let key: RegistryKey = (project_id.clone(), kind);
        {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            if let Some(existing) = registry.get(&key) {
                if !existing.status.is_terminal() {
                    return Err(CoreError::AlreadyRunning {
                        project: project_id,
                        kind,
                    });
                }
            }

            let now = Utc::now();
            registry.insert(
                key.clone(),
                WorkerRecord {
                    worker_id: worker_id.clone(),
                    project_id: project_id.clone(),
                    kind,
                    config,
                    status: WorkerStatus::Starting,
                    started_at: now,
                    ended_at: None,
                    last_heartbeat: now,
                    logs: VecDeque::new(),
                    errors: VecDeque::new(),
                    messages_processed: 0,
                    tasks_completed: 0,
                    error_count: 0,
                    restart_attempts,
                    direct_tx,
                    shutdown,
                    runner: None,
                },
            );

            // Spawned under the lock so the handle is in place before any
            // other caller can observe the record.
            let handle = tokio::spawn(self.handle().run_worker(
                key.clone(),
                worker_id.clone(),
                worker,
                ctx,
                events_rx,
            ));
            if let Some(record) = registry.get_mut(&key) {
                record.runner = Some(handle);
            }
        }

        info!(project_id = %project_id, worker_id = %worker_id, kind = %kind, "Worker launched");
        self.publish(SupervisorEvent::WorkerLaunched {
            project_id,
            worker_id: worker_id.clone(),
            kind,
        });
        Ok(worker_id)
    }

    /// Drives one worker's lifecycle; never lets a worker error escape.
    async fn run_worker(
        self: Arc<Self>,
        key: RegistryKey,
        worker_id: WorkerId,
        mut worker: Box<dyn Worker>,
        ctx: WorkerContext,
        events_rx: mpsc::Receiver<WorkerEvent>,
    ) {
        let relay = tokio::spawn(Arc::clone(&self).relay_events(
            key.clone(),
            worker_id.clone(),
            events_rx,
        ));

        match worker.initialize(&ctx).await {
            Ok(()) => {
                self.set_status(&key, &worker_id, WorkerStatus::Running);
                match worker.run_event_loop(&ctx).await {
                    Ok(()) => {
                        if let Err(e) = worker.shutdown(&ctx).await {
                            warn!(worker_id = %worker_id, error = %e, "Worker shutdown reported an error");
                            self.record_error(&key, &worker_id, &e.to_string());
                        }
                        self.finish(&key, &worker_id, WorkerStatus::Stopped, None);
                    }
                    Err(e) => {
                        error!(worker_id = %worker_id, error = %e, "Worker event loop failed");
                        self.finish(&key, &worker_id, WorkerStatus::Error, Some(e.to_string()));
                        self.maybe_auto_restart(&key);
                    }
                }
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Worker initialization failed");
                self.finish(&key, &worker_id, WorkerStatus::Error, Some(e.to_string()));
                self.maybe_auto_restart(&key);
            }
        }

        // Dropping the context (and the worker) closes the event channel so
        // the relay drains and exits.
        drop(ctx);
        drop(worker);
        let _ = relay.await;
    }

    /// Forwards every worker event onto the outbound stream, stamped with
    /// origin, and keeps the runtime record's heartbeat, counters, and ring
    /// buffers current. The payload is relayed unmodified.
    async fn relay_events(
        self: Arc<Self>,
        key: RegistryKey,
        worker_id: WorkerId,
        mut events_rx: mpsc::Receiver<WorkerEvent>,
    ) {
        while let Some(event) = events_rx.recv().await {
            {
                let mut registry = self.registry.write().expect("registry lock poisoned");
                if let Some(record) = registry.get_mut(&key) {
                    // A relaunch may have replaced the record; only the
                    // current incumbent gets bookkeeping.
                    if record.worker_id == worker_id {
                        record.last_heartbeat = Utc::now();
                        match &event {
                            WorkerEvent::Log { level, message } => {
                                record.push_log(format!("{}: {message}", level.as_str()));
                            }
                            WorkerEvent::Error { message } => {
                                record.push_error(message.clone());
                            }
                            WorkerEvent::TaskCompleted { .. } => {
                                record.tasks_completed += 1;
                            }
                            WorkerEvent::MessageProcessed { .. } => {
                                record.messages_processed += 1;
                            }
                            _ => {}
                        }
                    }
                }
            }

            let envelope = EventEnvelope::stamp(worker_id.clone(), key.0.clone(), event);
            self.publish(SupervisorEvent::Worker(envelope));
        }
    }

    /// Request cooperative shutdown and wait for the worker to wind down.
    ///
    /// Best-effort: nothing forcibly interrupts whatever blocking work the
    /// worker's own logic may be doing.
    pub async fn stop(
        &self,
        project_id: &ProjectId,
        worker_id: &WorkerId,
    ) -> Result<(), CoreError> {
        let (key, token, handle) = {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            let (key, record) = find_mut(&mut registry, project_id, worker_id)?;
            if record.status.is_terminal() {
                return Err(CoreError::NotRunning(worker_id.clone()));
            }
            record.status = WorkerStatus::Stopping;
            (key, record.shutdown.clone(), record.runner.take())
        };

        info!(project_id = %project_id, worker_id = %worker_id, "Stopping worker");
        self.publish(SupervisorEvent::WorkerStatusChanged {
            project_id: key.0.clone(),
            worker_id: worker_id.clone(),
            status: WorkerStatus::Stopping,
        });

        token.cancel();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Stop, pause briefly, drop the old record, and relaunch with the same
    /// config. Returns the new worker id.
    pub async fn restart(
        &self,
        project_id: &ProjectId,
        worker_id: &WorkerId,
    ) -> Result<WorkerId, CoreError> {
        let (key, config) = {
            let registry = self.registry.read().expect("registry lock poisoned");
            let (key, record) = find(&registry, project_id, worker_id)?;
            (key, record.config.clone())
        };

        match self.stop(project_id, worker_id).await {
            Ok(()) | Err(CoreError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }

        tokio::time::sleep(Duration::from_millis(self.config.restart_pause_ms)).await;

        self.registry
            .write()
            .expect("registry lock poisoned")
            .remove(&key);

        self.launch_inner(key.0, key.1, config, 0)
    }

    /// Deliver a message to a running worker: directly when it exposes a
    /// receive channel, otherwise through the message bus.
    pub async fn send_message(
        &self,
        project_id: &ProjectId,
        worker_id: &WorkerId,
        draft: MessageDraft,
    ) -> Result<(), CoreError> {
        let direct = {
            let registry = self.registry.read().expect("registry lock poisoned");
            let (_, record) = find(&registry, project_id, worker_id)?;
            if record.status != WorkerStatus::Running {
                return Err(CoreError::NotRunning(worker_id.clone()));
            }
            record.direct_tx.clone()
        };

        if let Some(tx) = direct {
            tx.send(draft.into_message())
                .await
                .map_err(|_| CoreError::NotRunning(worker_id.clone()))?;
        } else if let Some(bus) = &self.bus {
            bus.send(draft);
        } else {
            return Err(CoreError::worker(
                "worker accepts no direct delivery and no message bus is attached",
            ));
        }
        Ok(())
    }

    /// Classify every registered worker into liveness buckets.
    pub fn health_check(&self) -> HealthReport {
        let timeout = chrono::Duration::seconds(self.config.heartbeat_timeout_secs as i64);
        let now = Utc::now();
        let registry = self.registry.read().expect("registry lock poisoned");

        let mut report = HealthReport::default();
        for record in registry.values() {
            let key = record.key();
            if record.status.is_terminal() {
                report.stopped.push(key);
            } else if record.status == WorkerStatus::Running && now - record.last_heartbeat < timeout
            {
                report.healthy.push(key);
            } else {
                report.unhealthy.push(key);
            }
        }
        report
    }

    /// Snapshot of one worker.
    pub fn status(
        &self,
        project_id: &ProjectId,
        worker_id: &WorkerId,
    ) -> Result<WorkerSnapshot, CoreError> {
        let registry = self.registry.read().expect("registry lock poisoned");
        let (_, record) = find(&registry, project_id, worker_id)?;
        Ok(record.snapshot())
    }

    /// Snapshots of every worker in a project.
    pub fn list_for_project(&self, project_id: &ProjectId) -> Vec<WorkerSnapshot> {
        let registry = self.registry.read().expect("registry lock poisoned");
        registry
            .values()
            .filter(|r| &r.project_id == project_id)
            .map(WorkerRecord::snapshot)
            .collect()
    }

    /// Snapshots of every registered worker.
    pub fn list_all(&self) -> Vec<WorkerSnapshot> {
        let registry = self.registry.read().expect("registry lock poisoned");
        registry.values().map(WorkerRecord::snapshot).collect()
    }

    /// The last `n` log lines for one worker.
    pub fn logs(
        &self,
        project_id: &ProjectId,
        worker_id: &WorkerId,
        n: usize,
    ) -> Result<Vec<String>, CoreError> {
        let registry = self.registry.read().expect("registry lock poisoned");
        let (_, record) = find(&registry, project_id, worker_id)?;
        let skip = record.logs.len().saturating_sub(n);
        Ok(record.logs.iter().skip(skip).cloned().collect())
    }

    /// Bulk shutdown: stop every worker and remove all records.
    pub async fn stop_all(&self) {
        let work: Vec<(CancellationToken, Option<JoinHandle<()>>)> = {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            registry
                .values_mut()
                .map(|record| {
                    if !record.status.is_terminal() {
                        record.status = WorkerStatus::Stopping;
                    }
                    (record.shutdown.clone(), record.runner.take())
                })
                .collect()
        };

        for (token, handle) in work {
            token.cancel();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }

        self.registry
            .write()
            .expect("registry lock poisoned")
            .clear();
        info!("All workers stopped and registry cleared");
    }

    fn set_status(&self, key: &RegistryKey, worker_id: &WorkerId, status: WorkerStatus) {
        let updated = {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            match registry.get_mut(key) {
                Some(record) if &record.worker_id == worker_id => {
                    record.status = status;
                    record.last_heartbeat = Utc::now();
                    true
                }
                _ => false,
            }
        };

        if updated {
            self.publish(SupervisorEvent::WorkerStatusChanged {
                project_id: key.0.clone(),
                worker_id: worker_id.clone(),
                status,
            });
        }
    }

    fn record_error(&self, key: &RegistryKey, worker_id: &WorkerId, message: &str) {
        let mut registry = self.registry.write().expect("registry lock poisoned");
        if let Some(record) = registry.get_mut(key) {
            if &record.worker_id == worker_id {
                record.push_error(message.to_string());
            }
        }
    }

    /// Final bookkeeping when a runner exits: stamp the end, detach direct
    /// delivery, and emit the terminal event.
    fn finish(
        &self,
        key: &RegistryKey,
        worker_id: &WorkerId,
        status: WorkerStatus,
        error: Option<String>,
    ) {
        let updated = {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            match registry.get_mut(key) {
                Some(record) if &record.worker_id == worker_id => {
                    record.status = status;
                    record.ended_at = Some(Utc::now());
                    record.direct_tx = None;
                    if let Some(message) = &error {
                        record.push_error(message.clone());
                    }
                    true
                }
                _ => false,
            }
        };

        if !updated {
            return;
        }
        match error {
            Some(error) => self.publish(SupervisorEvent::WorkerFailed {
                project_id: key.0.clone(),
                worker_id: worker_id.clone(),
                error,
            }),
            None => self.publish(SupervisorEvent::WorkerStopped {
                project_id: key.0.clone(),
                worker_id: worker_id.clone(),
            }),
        }
    }

    /// Schedule a relaunch after a failure, with bounded exponential backoff
    /// and a little jitter. No-op unless enabled in config.
    fn maybe_auto_restart(&self, key: &RegistryKey) {
        if !self.config.auto_restart {
            return;
        }

        let (worker_id, config, attempts) = {
            let registry = self.registry.read().expect("registry lock poisoned");
            match registry.get(key) {
                Some(record) => (
                    record.worker_id.clone(),
                    record.config.clone(),
                    record.restart_attempts,
                ),
                None => return,
            }
        };

        if attempts >= self.config.max_restart_attempts {
            warn!(
                project_id = %key.0,
                worker_id = %worker_id,
                attempts,
                "Giving up on auto-restart"
            );
            return;
        }

        let base = self.config.restart_backoff_base_ms.saturating_mul(1 << attempts.min(16));
        let capped = base.min(self.config.restart_backoff_cap_ms);
        let jittered = (capped as f64 * rand::thread_rng().gen_range(0.9..=1.1)) as u64;
        let delay = Duration::from_millis(jittered);

        info!(
            project_id = %key.0,
            worker_id = %worker_id,
            attempt = attempts + 1,
            delay_ms = jittered,
            "Scheduling auto-restart"
        );

        let supervisor = self.handle();
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Only relaunch if the failed record is still the incumbent; a
            // manual restart or launch in the meantime wins.
            {
                let mut registry = supervisor.registry.write().expect("registry lock poisoned");
                match registry.get(&key) {
                    Some(record)
                        if record.worker_id == worker_id
                            && record.status == WorkerStatus::Error =>
                    {
                        registry.remove(&key);
                    }
                    _ => return,
                }
            }

            if let Err(e) =
                supervisor.launch_inner(key.0.clone(), key.1, config, attempts + 1)
            {
                warn!(project_id = %key.0, error = %e, "Auto-restart failed");
            }
        });
    }

    pub(crate) fn publish(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn find<'a>(
    registry: &'a HashMap<RegistryKey, WorkerRecord>,
    project_id: &ProjectId,
    worker_id: &WorkerId,
) -> Result<(RegistryKey, &'a WorkerRecord), CoreError> {
    registry
        .iter()
        .find(|((project, _), record)| project == project_id && &record.worker_id == worker_id)
        .map(|(key, record)| (key.clone(), record))
        .ok_or_else(|| CoreError::WorkerNotFound(worker_id.clone()))
}

fn find_mut<'a>(
    registry: &'a mut HashMap<RegistryKey, WorkerRecord>,
    project_id: &ProjectId,
    worker_id: &WorkerId,
) -> Result<(RegistryKey, &'a mut WorkerRecord), CoreError> {
    registry
        .iter_mut()
        .find(|((project, _), record)| project == project_id && &record.worker_id == worker_id)
        .map(|(key, record)| (key.clone(), record))
        .ok_or_else(|| CoreError::WorkerNotFound(worker_id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{Message, Priority};
    use std::sync::Mutex as StdMutex;

    struct IdleWorker;

    #[async_trait::async_trait]
    impl Worker for IdleWorker {
        async fn initialize(&mut self, _ctx: &WorkerContext) -> Result<(), CoreError> {
            Ok(())
        }

        async fn run_event_loop(&mut self, ctx: &WorkerContext) -> Result<(), CoreError> {
            ctx.shutdown.cancelled().await;
            Ok(())
        }

        async fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), CoreError> {
            Ok(())
        }
    }

    struct FailingInitWorker;

    #[async_trait::async_trait]
    impl Worker for FailingInitWorker {
        async fn initialize(&mut self, _ctx: &WorkerContext) -> Result<(), CoreError> {
            Err(CoreError::worker("bad credentials"))
        }

        async fn run_event_loop(&mut self, _ctx: &WorkerContext) -> Result<(), CoreError> {
            Ok(())
        }

        async fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), CoreError> {
            Ok(())
        }
    }

    struct EmittingWorker {
        events: Vec<WorkerEvent>,
    }

    #[async_trait::async_trait]
    impl Worker for EmittingWorker {
        async fn initialize(&mut self, _ctx: &WorkerContext) -> Result<(), CoreError> {
            Ok(())
        }

        async fn run_event_loop(&mut self, ctx: &WorkerContext) -> Result<(), CoreError> {
            for event in self.events.drain(..) {
                ctx.emit(event).await;
            }
            ctx.shutdown.cancelled().await;
            Ok(())
        }

        async fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), CoreError> {
            Ok(())
        }
    }

    struct ReceivingWorker {
        tx: mpsc::Sender<Message>,
        rx: Option<mpsc::Receiver<Message>>,
        seen: Arc<StdMutex<Vec<Message>>>,
    }

    impl ReceivingWorker {
        fn new(seen: Arc<StdMutex<Vec<Message>>>) -> Self {
            let (tx, rx) = mpsc::channel(8);
            Self {
                tx,
                rx: Some(rx),
                seen,
            }
        }
    }

    #[async_trait::async_trait]
    impl Worker for ReceivingWorker {
        async fn initialize(&mut self, _ctx: &WorkerContext) -> Result<(), CoreError> {
            Ok(())
        }

        async fn run_event_loop(&mut self, ctx: &WorkerContext) -> Result<(), CoreError> {
            let mut rx = self
                .rx
                .take()
                .ok_or_else(|| CoreError::worker("event loop entered twice"))?;
            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => return Ok(()),
                    message = rx.recv() => match message {
                        Some(message) => {
                            let id = message.id.clone();
                            self.seen.lock().unwrap().push(message);
                            ctx.emit(WorkerEvent::MessageProcessed { message_id: id }).await;
                        }
                        None => return Ok(()),
                    },
                }
            }
        }

        async fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), CoreError> {
            Ok(())
        }

        fn message_sender(&self) -> Option<mpsc::Sender<Message>> {
            Some(self.tx.clone())
        }
    }

    fn idle_supervisor() -> Arc<Supervisor> {
        let mut factory = WorkerFactory::new();
        factory.register(WorkerKind::Scripted, |_config| Box::new(IdleWorker));
        Supervisor::new(factory, None, None, SupervisorConfig::default())
    }

    async fn wait_for_status(
        supervisor: &Arc<Supervisor>,
        project_id: &ProjectId,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) {
        for _ in 0..200 {
            if supervisor
                .status(project_id, worker_id)
                .map(|s| s.status == status)
                .unwrap_or(false)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker {worker_id} never reached {status}");
    }

    #[tokio::test]
    async fn test_launch_reaches_running() {
        let supervisor = idle_supervisor();
        let project = ProjectId::from("demo");

        let worker_id = supervisor
            .launch(project.clone(), WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();
        wait_for_status(&supervisor, &project, &worker_id, WorkerStatus::Running).await;
    }

    #[tokio::test]
    async fn test_duplicate_launch_fails_until_stopped() {
        let supervisor = idle_supervisor();
        let project = ProjectId::from("demo");

        let worker_id = supervisor
            .launch(project.clone(), WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();

        let second =
            supervisor.launch(project.clone(), WorkerKind::Scripted, WorkerConfig::default());
        assert!(matches!(second, Err(CoreError::AlreadyRunning { .. })));

        wait_for_status(&supervisor, &project, &worker_id, WorkerStatus::Running).await;
        supervisor.stop(&project, &worker_id).await.unwrap();

        // Plain stop keeps the record around for inspection.
        let snapshot = supervisor.status(&project, &worker_id).unwrap();
        assert_eq!(snapshot.status, WorkerStatus::Stopped);
        assert!(snapshot.ended_at.is_some());

        supervisor
            .launch(project, WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_without_registering() {
        let supervisor = idle_supervisor();
        let result = supervisor.launch("demo", WorkerKind::Command, WorkerConfig::default());
        assert!(matches!(result, Err(CoreError::UnknownWorkerKind(_))));
        assert!(supervisor.list_all().is_empty());
    }

    #[tokio::test]
    async fn test_init_failure_becomes_error_status_and_event() {
        let mut factory = WorkerFactory::new();
        factory.register(WorkerKind::Scripted, |_config| Box::new(FailingInitWorker));
        let supervisor = Supervisor::new(factory, None, None, SupervisorConfig::default());
        let project = ProjectId::from("demo");

        let mut events = supervisor.subscribe();
        let worker_id = supervisor
            .launch(project.clone(), WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();

        wait_for_status(&supervisor, &project, &worker_id, WorkerStatus::Error).await;

        let snapshot = supervisor.status(&project, &worker_id).unwrap();
        assert_eq!(snapshot.error_count, 1);
        assert!(snapshot.last_error.as_deref().unwrap_or("").contains("bad credentials"));

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SupervisorEvent::WorkerFailed { .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure, "expected a WorkerFailed event");

        // The supervisor itself is unharmed.
        assert_eq!(supervisor.list_all().len(), 1);
    }

    #[tokio::test]
    async fn test_events_are_forwarded_stamped_and_unmodified() {
        let thought = WorkerEvent::thought("use the cache");
        let emitted = thought.clone();
        let mut factory = WorkerFactory::new();
        factory.register(WorkerKind::Scripted, move |_config| {
            Box::new(EmittingWorker {
                events: vec![emitted.clone()],
            })
        });
        let supervisor = Supervisor::new(factory, None, None, SupervisorConfig::default());
        let project = ProjectId::from("demo");

        let mut events = supervisor.subscribe();
        let worker_id = supervisor
            .launch(project.clone(), WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();

        let envelope = loop {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("event stream stalled")
                .expect("event stream closed");
            if let SupervisorEvent::Worker(envelope) = event {
                break envelope;
            }
        };

        assert_eq!(envelope.worker_id, worker_id);
        assert_eq!(envelope.project_id, project);
        assert_eq!(envelope.event, thought);
    }

    #[tokio::test]
    async fn test_restart_replaces_record_with_same_config() {
        let supervisor = idle_supervisor();
        let project = ProjectId::from("demo");
        let config = WorkerConfig::default().with_model("sonnet");

        let first = supervisor
            .launch(project.clone(), WorkerKind::Scripted, config.clone())
            .unwrap();
        wait_for_status(&supervisor, &project, &first, WorkerStatus::Running).await;

        let second = supervisor.restart(&project, &first).await.unwrap();
        assert_ne!(first, second);

        // Exactly one record remains, carrying the original config.
        assert_eq!(supervisor.list_all().len(), 1);
        wait_for_status(&supervisor, &project, &second, WorkerStatus::Running).await;
        let registry = supervisor.registry.read().unwrap();
        let record = registry.values().next().unwrap();
        assert_eq!(record.config.model.as_deref(), Some("sonnet"));
    }

    #[tokio::test]
    async fn test_send_message_direct_delivery() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_for_factory = seen.clone();
        let mut factory = WorkerFactory::new();
        factory.register(WorkerKind::Scripted, move |_config| {
            Box::new(ReceivingWorker::new(seen_for_factory.clone()))
        });
        let supervisor = Supervisor::new(factory, None, None, SupervisorConfig::default());
        let project = ProjectId::from("demo");

        let worker_id = supervisor
            .launch(project.clone(), WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();
        wait_for_status(&supervisor, &project, &worker_id, WorkerStatus::Running).await;

        supervisor
            .send_message(
                &project,
                &worker_id,
                MessageDraft::new("planner", worker_id.as_str(), "nudge"),
            )
            .await
            .unwrap();

        for _ in 0..200 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let received = seen.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, "nudge");
    }

    #[tokio::test]
    async fn test_send_message_routes_through_bus_without_direct_channel() {
        let bus = Arc::new(MessageBus::new());
        let mut factory = WorkerFactory::new();
        factory.register(WorkerKind::Scripted, |_config| Box::new(IdleWorker));
        let supervisor =
            Supervisor::new(factory, None, Some(bus.clone()), SupervisorConfig::default());
        let project = ProjectId::from("demo");

        let worker_id = supervisor
            .launch(project.clone(), WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();
        wait_for_status(&supervisor, &project, &worker_id, WorkerStatus::Running).await;

        supervisor
            .send_message(
                &project,
                &worker_id,
                MessageDraft::new("planner", worker_id.as_str(), "nudge")
                    .with_priority(Priority::High),
            )
            .await
            .unwrap();

        assert_eq!(bus.pending_count(&worker_id), 1);
    }

    #[tokio::test]
    async fn test_send_message_to_stopped_worker_fails() {
        let supervisor = idle_supervisor();
        let project = ProjectId::from("demo");

        let worker_id = supervisor
            .launch(project.clone(), WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();
        wait_for_status(&supervisor, &project, &worker_id, WorkerStatus::Running).await;
        supervisor.stop(&project, &worker_id).await.unwrap();

        let result = supervisor
            .send_message(
                &project,
                &worker_id,
                MessageDraft::new("planner", worker_id.as_str(), "nudge"),
            )
            .await;
        assert!(matches!(result, Err(CoreError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_health_buckets() {
        let supervisor = idle_supervisor();
        let project = ProjectId::from("demo");

        let fresh = supervisor
            .launch(project.clone(), WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();
        let stale = supervisor
            .launch(ProjectId::from("other"), WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();
        wait_for_status(&supervisor, &project, &fresh, WorkerStatus::Running).await;
        wait_for_status(&supervisor, &ProjectId::from("other"), &stale, WorkerStatus::Running)
            .await;

        // Age the second worker's heartbeat past the 60s window.
        {
            let mut registry = supervisor.registry.write().unwrap();
            let record = registry
                .values_mut()
                .find(|r| r.worker_id == stale)
                .unwrap();
            record.last_heartbeat = Utc::now() - chrono::Duration::seconds(61);
        }

        let report = supervisor.health_check();
        assert!(report.healthy.iter().any(|k| k.worker_id == fresh));
        assert!(report.unhealthy.iter().any(|k| k.worker_id == stale));
        assert!(report.stopped.is_empty());

        // A stopped worker lands in the stopped bucket regardless of
        // heartbeat age.
        supervisor.stop(&project, &fresh).await.unwrap();
        let report = supervisor.health_check();
        assert!(report.stopped.iter().any(|k| k.worker_id == fresh));
    }

    #[tokio::test]
    async fn test_logs_returns_last_n() {
        let mut factory = WorkerFactory::new();
        factory.register(WorkerKind::Scripted, |_config| {
            Box::new(EmittingWorker {
                events: (0..5).map(|i| WorkerEvent::info(format!("line {i}"))).collect(),
            })
        });
        let supervisor = Supervisor::new(factory, None, None, SupervisorConfig::default());
        let project = ProjectId::from("demo");

        let worker_id = supervisor
            .launch(project.clone(), WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();
        wait_for_status(&supervisor, &project, &worker_id, WorkerStatus::Running).await;

        for _ in 0..200 {
            if supervisor.logs(&project, &worker_id, 10).unwrap().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let logs = supervisor.logs(&project, &worker_id, 2).unwrap();
        assert_eq!(logs, vec!["info: line 3".to_string(), "info: line 4".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_all_clears_registry() {
        let supervisor = idle_supervisor();
        supervisor
            .launch("p1", WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();
        supervisor
            .launch("p2", WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();

        supervisor.stop_all().await;
        assert!(supervisor.list_all().is_empty());

        let unknown = supervisor.status(&ProjectId::from("p1"), &WorkerId::from("gone"));
        assert!(matches!(unknown, Err(CoreError::WorkerNotFound(_))));
    }

    #[tokio::test]
    async fn test_auto_restart_backs_off_and_gives_up() {
        let mut factory = WorkerFactory::new();
        factory.register(WorkerKind::Scripted, |_config| Box::new(FailingInitWorker));
        let config = SupervisorConfig {
            auto_restart: true,
            restart_backoff_base_ms: 10,
            restart_backoff_cap_ms: 40,
            max_restart_attempts: 2,
            ..SupervisorConfig::default()
        };
        let supervisor = Supervisor::new(factory, None, None, config);
        supervisor
            .launch("demo", WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();

        // Initial failure plus two relaunches, then the supervisor gives up.
        for _ in 0..400 {
            let snapshots = supervisor.list_all();
            if snapshots.len() == 1
                && snapshots[0].status == WorkerStatus::Error
                && snapshots[0].restart_attempts == 2
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("auto-restart never ran its course");
    }

    #[tokio::test]
    async fn test_message_processed_bumps_counter() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_for_factory = seen.clone();
        let mut factory = WorkerFactory::new();
        factory.register(WorkerKind::Scripted, move |_config| {
            Box::new(ReceivingWorker::new(seen_for_factory.clone()))
        });
        let supervisor = Supervisor::new(factory, None, None, SupervisorConfig::default());
        let project = ProjectId::from("demo");

        let worker_id = supervisor
            .launch(project.clone(), WorkerKind::Scripted, WorkerConfig::default())
            .unwrap();
        wait_for_status(&supervisor, &project, &worker_id, WorkerStatus::Running).await;

        supervisor
            .send_message(
                &project,
                &worker_id,
                MessageDraft::new("planner", worker_id.as_str(), "nudge"),
            )
            .await
            .unwrap();

        for _ in 0..200 {
            let snapshot = supervisor.status(&project, &worker_id).unwrap();
            if snapshot.messages_processed == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("messages_processed counter never updated");
    }
}
