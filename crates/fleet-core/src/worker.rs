//! Worker kind tags and per-launch configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// The closed set of worker implementations the factory can construct.
///
/// Kinds are compile-time tags, not dynamically loaded names; resolving one
/// is a map lookup over registered constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Process-hosted worker driving an external AI CLI.
    Command,
    /// In-process worker replaying a scripted sequence of events.
    Scripted,
}

impl WorkerKind {
    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Command => "command",
            WorkerKind::Scripted => "scripted",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" => Ok(WorkerKind::Command),
            "scripted" => Ok(WorkerKind::Scripted),
            other => Err(format!("unknown worker kind: {other}")),
        }
    }
}

/// Per-launch worker configuration.
///
/// Command workers use the process fields; in-process workers only read what
/// applies to them. A restart relaunches with the same config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// External CLI binary, resolved via PATH when not absolute.
    pub command: String,

    /// Extra arguments appended to the command line.
    #[serde(default)]
    pub args: Vec<String>,

    /// Model to pass through to the CLI, when it supports one.
    #[serde(default)]
    pub model: Option<String>,

    /// System prompt appended to the CLI invocation.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Working directory for the spawned process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Additional environment variables for the spawned process.
    #[serde(default)]
    pub env: Vec<(String, String)>,

    /// How often the worker reports a heartbeat status update, in seconds.
    pub heartbeat_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            model: None,
            system_prompt: None,
            working_dir: None,
            env: Vec::new(),
            heartbeat_interval_secs: 15,
        }
    }
}

impl WorkerConfig {
    /// Builder method to set the CLI binary.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Builder method to append an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Builder method to set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Builder method to set the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Builder method to add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in [WorkerKind::Command, WorkerKind::Scripted] {
            assert_eq!(kind.as_str().parse::<WorkerKind>().ok(), Some(kind));
        }
        assert!("reticulator".parse::<WorkerKind>().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerConfig::default()
            .with_command("claude")
            .with_model("sonnet")
            .with_arg("--verbose")
            .with_env("NO_COLOR", "1");

        assert_eq!(config.model.as_deref(), Some("sonnet"));
        assert_eq!(config.args, vec!["--verbose".to_string()]);
        assert_eq!(config.env.len(), 1);
    }
}
