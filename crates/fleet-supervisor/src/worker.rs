//! Worker contract and the factory resolving kinds to implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fleet_core::{CoreError, Message, ProjectId, WorkerConfig, WorkerEvent, WorkerId, WorkerKind};

use crate::bus::MessageBus;
use crate::store::TaskStore;

/// Everything a worker receives from its host.
///
/// The context is owned by the supervisor's runner task and handed to the
/// worker by reference for each lifecycle call.
pub struct WorkerContext {
    /// Project this worker serves.
    pub project_id: ProjectId,

    /// This worker's registry id.
    pub worker_id: WorkerId,

    /// The launch configuration, also reused on restart.
    pub config: WorkerConfig,

    /// Outbound domain events; the supervisor relays these verbatim.
    pub events: mpsc::Sender<WorkerEvent>,

    /// Task store handle, when the host injected one.
    pub tasks: Option<Arc<TaskStore>>,

    /// Message bus handle, when the host injected one.
    pub bus: Option<Arc<MessageBus>>,

    /// Fires when shutdown is requested; `run_event_loop` must return soon
    /// after.
    pub shutdown: CancellationToken,
}

impl WorkerContext {
    /// Emit a domain event. A full or closed channel drops the event rather
    /// than blocking worker progress indefinitely.
    pub async fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event).await;
    }
}

/// The capability set every worker implementation provides.
///
/// `run_event_loop` runs until `ctx.shutdown` fires; errors returned from
/// `initialize` or the loop are converted by the supervisor into a worker
/// status of `error` and never crash the host.
#[async_trait]
pub trait Worker: Send + 'static {
    /// One-time setup before the event loop.
    async fn initialize(&mut self, ctx: &WorkerContext) -> Result<(), CoreError>;

    /// The worker's main loop. Must observe `ctx.shutdown`.
    async fn run_event_loop(&mut self, ctx: &WorkerContext) -> Result<(), CoreError>;

    /// Cooperative teardown after the loop exits.
    async fn shutdown(&mut self, ctx: &WorkerContext) -> Result<(), CoreError>;

    /// Workers accepting direct delivery expose a sender here; the
    /// supervisor falls back to the message bus for the rest.
    fn message_sender(&self) -> Option<mpsc::Sender<Message>> {
        None
    }
}

/// Constructor registered for one worker kind.
pub type WorkerCtor = Box<dyn Fn(&WorkerConfig) -> Box<dyn Worker> + Send + Sync>;

/// Registry mapping the closed set of worker kinds to constructors.
///
/// Resolution is a map lookup, never dynamic loading; tests can override a
/// kind with a mock via [`WorkerFactory::register`].
#[derive(Default)]
pub struct WorkerFactory {
    ctors: HashMap<WorkerKind, WorkerCtor>,
}

impl WorkerFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for a kind.
    pub fn register<F>(&mut self, kind: WorkerKind, ctor: F)
    where
        F: Fn(&WorkerConfig) -> Box<dyn Worker> + Send + Sync + 'static,
    {
        self.ctors.insert(kind, Box::new(ctor));
    }

    /// Construct a worker of the given kind.
    pub fn build(
        &self,
        kind: WorkerKind,
        config: &WorkerConfig,
    ) -> Result<Box<dyn Worker>, CoreError> {
        self.ctors
            .get(&kind)
            .map(|ctor| ctor(config))
            .ok_or_else(|| CoreError::UnknownWorkerKind(kind.to_string()))
    }

    /// Kinds this factory can construct.
    pub fn kinds(&self) -> Vec<WorkerKind> {
        self.ctors.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopWorker;

    #[async_trait]
    impl Worker for NoopWorker {
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

    #[test]
    fn test_factory_builds_registered_kind() {
        let mut factory = WorkerFactory::new();
        factory.register(WorkerKind::Scripted, |_config| Box::new(NoopWorker));

        assert!(factory.build(WorkerKind::Scripted, &WorkerConfig::default()).is_ok());
        assert_eq!(factory.kinds(), vec![WorkerKind::Scripted]);
    }

    #[test]
    fn test_factory_rejects_unregistered_kind() {
        let factory = WorkerFactory::new();
        let result = factory.build(WorkerKind::Command, &WorkerConfig::default());
        assert!(matches!(result, Err(CoreError::UnknownWorkerKind(_))));
    }
}
