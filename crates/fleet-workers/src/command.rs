//! Process-hosted worker driving an external AI CLI.
//!
//! The child is spawned during `initialize` and supervised by the event
//! loop; stdout and stderr are streamed line by line into domain events. On
//! shutdown the child gets a termination signal and, if it has not exited
//! within the grace period, a forced kill.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fleet_core::{CoreError, LogLevel, WorkerConfig, WorkerEvent};
use fleet_supervisor::{Worker, WorkerContext};

/// Grace period between the termination signal and a forced kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Hosts one external CLI process for the lifetime of the worker.
pub struct CommandWorker {
    child: Option<Child>,
    readers: Vec<JoinHandle<()>>,
}

impl CommandWorker {
    /// Create a worker; the process is spawned during `initialize`.
    pub fn new() -> Self {
        Self {
            child: None,
            readers: Vec::new(),
        }
    }
}

impl Default for CommandWorker {
    fn default() -> Self {
        Self::new()
    }
}

/// Assemble the CLI invocation from the launch config.
fn build_command(config: &WorkerConfig) -> Command {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    if let Some(model) = &config.model {
        cmd.arg("--model").arg(model);
    }
    if let Some(prompt) = &config.system_prompt {
        cmd.arg("--append-system-prompt").arg(prompt);
    }
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Map one line of CLI output onto a domain event.
///
/// Structured lines carry a `type` discriminator; anything else is relayed
/// as an info log line.
fn classify_line(line: &str) -> WorkerEvent {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
        let text = value
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or(line)
            .to_string();
        match value.get("type").and_then(|t| t.as_str()) {
            Some("thought") | Some("thinking") => return WorkerEvent::Thought { text },
            Some("decision") => return WorkerEvent::Decision { text },
            Some("planning") | Some("plan") => return WorkerEvent::Planning { text },
            Some("error") => return WorkerEvent::error(text),
            _ => {}
        }
    }
    WorkerEvent::info(line.to_string())
}

/// Ask the child to exit: SIGTERM on unix, a hard kill elsewhere.
fn request_exit(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                return;
            }
        }
    }
    let _ = child.start_kill();
}

/// Wait out the grace period, then terminate forcibly.
async fn terminate(ctx: &WorkerContext, mut child: Child) -> Result<(), CoreError> {
    request_exit(&mut child);

    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(_) => Ok(()),
        Err(_) => {
            let timeout = CoreError::Timeout(SHUTDOWN_GRACE.as_secs());
            warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Child ignored termination signal");
            ctx.emit(WorkerEvent::error(timeout.to_string())).await;
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(())
        }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn initialize(&mut self, ctx: &WorkerContext) -> Result<(), CoreError> {
        let mut child = build_command(&ctx.config).spawn().map_err(|e| {
            CoreError::worker(format!("failed to spawn '{}': {e}", ctx.config.command))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::worker("child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CoreError::worker("child stderr unavailable"))?;

        let events = ctx.events.clone();
        self.readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = events.send(classify_line(trimmed)).await;
            }
        }));

        let events = ctx.events.clone();
        self.readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = events
                    .send(WorkerEvent::log(LogLevel::Warn, trimmed.to_string()))
                    .await;
            }
        }));

        info!(
            worker_id = %ctx.worker_id,
            command = %ctx.config.command,
            "External CLI process spawned"
        );
        self.child = Some(child);
        Ok(())
    }

    async fn run_event_loop(&mut self, ctx: &WorkerContext) -> Result<(), CoreError> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| CoreError::worker("no child process; initialize first"))?;

        let mut heartbeat = tokio::time::interval(Duration::from_secs(
            ctx.config.heartbeat_interval_secs.max(1),
        ));

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => {
                    return terminate(ctx, child).await;
                }
                status = child.wait() => {
                    return match status {
                        Ok(status) if status.success() => Ok(()),
                        Ok(status) => Err(CoreError::worker(format!(
                            "'{}' exited with {status}",
                            ctx.config.command
                        ))),
                        Err(e) => Err(CoreError::worker(format!("wait failed: {e}"))),
                    };
                }
                _ = heartbeat.tick() => {
                    ctx.emit(WorkerEvent::StatusUpdate {
                        state: "working".to_string(),
                    })
                    .await;
                }
            }
        }
    }

    async fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), CoreError> {
        // The readers drain to EOF once the child's pipes close.
        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{ProjectId, WorkerId};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn context_for(config: WorkerConfig) -> (WorkerContext, mpsc::Receiver<WorkerEvent>) {
        let (events, rx) = mpsc::channel(64);
        let ctx = WorkerContext {
            project_id: ProjectId::from("demo"),
            worker_id: WorkerId::from("cli-worker"),
            config,
            events,
            tasks: None,
            bus: None,
            shutdown: CancellationToken::new(),
        };
        (ctx, rx)
    }

    #[test]
    fn test_classify_structured_lines() {
        assert_eq!(
            classify_line(r#"{"type":"thought","text":"check the diff"}"#),
            WorkerEvent::Thought {
                text: "check the diff".to_string()
            }
        );
        assert_eq!(
            classify_line(r#"{"type":"decision","text":"ship it"}"#),
            WorkerEvent::Decision {
                text: "ship it".to_string()
            }
        );
        assert_eq!(
            classify_line("plain progress output"),
            WorkerEvent::info("plain progress output")
        );
    }

    #[test]
    fn test_build_command_includes_flags() {
        let config = WorkerConfig::default()
            .with_command("claude")
            .with_model("sonnet")
            .with_arg("--verbose");
        let cmd = build_command(&config);

        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["--verbose", "--model", "sonnet"]);
    }

    #[tokio::test]
    async fn test_streams_stdout_as_events_and_exits_cleanly() {
        let config = WorkerConfig::default()
            .with_command("sh")
            .with_arg("-c")
            .with_arg("echo hello");
        let (ctx, mut rx) = context_for(config);

        let mut worker = CommandWorker::new();
        worker.initialize(&ctx).await.unwrap();
        worker.run_event_loop(&ctx).await.unwrap();
        worker.shutdown(&ctx).await.unwrap();

        let mut saw_hello = false;
        while let Ok(event) = rx.try_recv() {
            if event == WorkerEvent::info("hello") {
                saw_hello = true;
            }
        }
        assert!(saw_hello, "expected the child's stdout as a log event");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let config = WorkerConfig::default()
            .with_command("sh")
            .with_arg("-c")
            .with_arg("exit 3");
        let (ctx, _rx) = context_for(config);

        let mut worker = CommandWorker::new();
        worker.initialize(&ctx).await.unwrap();
        let result = worker.run_event_loop(&ctx).await;
        assert!(matches!(result, Err(CoreError::Worker(_))));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_long_running_child() {
        let config = WorkerConfig::default()
            .with_command("sh")
            .with_arg("-c")
            .with_arg("sleep 60");
        let (ctx, _rx) = context_for(config);

        let mut worker = CommandWorker::new();
        worker.initialize(&ctx).await.unwrap();

        ctx.shutdown.cancel();
        let started = std::time::Instant::now();
        worker.run_event_loop(&ctx).await.unwrap();
        assert!(
            started.elapsed() < SHUTDOWN_GRACE,
            "sh should exit on the termination signal well inside the grace period"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_fails_initialize() {
        let config = WorkerConfig::default().with_command("definitely-not-a-real-binary");
        let (ctx, _rx) = context_for(config);

        let mut worker = CommandWorker::new();
        let result = worker.initialize(&ctx).await;
        assert!(matches!(result, Err(CoreError::Worker(_))));
    }
}
