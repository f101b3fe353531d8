//! In-process worker replaying a scripted sequence of events.
//!
//! Deterministic and dependency-free, which makes it the worker of choice
//! for exercising the supervisor, the health monitor, and dashboards.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use fleet_core::{CoreError, Message, WorkerEvent};
use fleet_supervisor::{Worker, WorkerContext};

/// Replays its script, then idles processing direct messages until shutdown.
pub struct ScriptedWorker {
    steps: Vec<WorkerEvent>,
    step_delay: Duration,
    tx: mpsc::Sender<Message>,
    rx: Option<mpsc::Receiver<Message>>,
}

impl ScriptedWorker {
    /// Create a worker that will emit the given events in order.
    pub fn new(steps: Vec<WorkerEvent>) -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            steps,
            step_delay: Duration::ZERO,
            tx,
            rx: Some(rx),
        }
    }

    /// Builder method to pace the script.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn initialize(&mut self, ctx: &WorkerContext) -> Result<(), CoreError> {
        info!(worker_id = %ctx.worker_id, steps = self.steps.len(), "Scripted worker ready");
        Ok(())
    }

    async fn run_event_loop(&mut self, ctx: &WorkerContext) -> Result<(), CoreError> {
        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| CoreError::worker("event loop entered twice"))?;

        for event in self.steps.drain(..) {
            if ctx.shutdown.is_cancelled() {
                return Ok(());
            }
            ctx.emit(event).await;
            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
        }

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => return Ok(()),
                message = rx.recv() => match message {
                    Some(message) => {
                        ctx.emit(WorkerEvent::MessageProcessed {
                            message_id: message.id,
                        })
                        .await;
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    async fn shutdown(&mut self, ctx: &WorkerContext) -> Result<(), CoreError> {
        info!(worker_id = %ctx.worker_id, "Scripted worker shut down");
        Ok(())
    }

    fn message_sender(&self) -> Option<mpsc::Sender<Message>> {
        Some(self.tx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{MessageDraft, ProjectId, WorkerConfig, WorkerId};
    use tokio_util::sync::CancellationToken;

    fn context() -> (WorkerContext, mpsc::Receiver<WorkerEvent>) {
        let (events, rx) = mpsc::channel(64);
        let ctx = WorkerContext {
            project_id: ProjectId::from("demo"),
            worker_id: WorkerId::from("scripted"),
            config: WorkerConfig::default(),
            events,
            tasks: None,
            bus: None,
            shutdown: CancellationToken::new(),
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_replays_script_in_order() {
        let (ctx, mut rx) = context();
        let mut worker = ScriptedWorker::new(vec![
            WorkerEvent::thought("look at the failing test"),
            WorkerEvent::info("patched"),
        ]);

        worker.initialize(&ctx).await.unwrap();

        let shutdown = ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });
        worker.run_event_loop(&ctx).await.unwrap();

        assert_eq!(
            rx.try_recv().ok(),
            Some(WorkerEvent::thought("look at the failing test"))
        );
        assert_eq!(rx.try_recv().ok(), Some(WorkerEvent::info("patched")));
    }

    #[tokio::test]
    async fn test_processes_direct_messages() {
        let (ctx, mut rx) = context();
        let mut worker = ScriptedWorker::new(Vec::new());
        let sender = worker.message_sender().expect("direct channel");

        worker.initialize(&ctx).await.unwrap();

        let message = MessageDraft::new("peer", "scripted", "ping").into_message();
        let message_id = message.id.clone();
        sender.send(message).await.unwrap();

        let shutdown = ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });
        worker.run_event_loop(&ctx).await.unwrap();

        let mut processed = false;
        while let Ok(event) = rx.try_recv() {
            if event == (WorkerEvent::MessageProcessed { message_id: message_id.clone() }) {
                processed = true;
            }
        }
        assert!(processed, "expected a message_processed event");
    }
}
