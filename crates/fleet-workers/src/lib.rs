//! Worker implementations for Fleet.
//!
//! Two workers satisfy the supervisor's contract out of the box:
//!
//! - [`CommandWorker`] hosts an external AI CLI as a child process,
//!   translating its output stream into domain events and honoring the
//!   graceful-termination contract on shutdown.
//! - [`ScriptedWorker`] replays a fixed sequence of events in-process and
//!   accepts direct message delivery; demos and tests lean on it.

pub mod command;
pub mod scripted;

pub use command::CommandWorker;
pub use scripted::ScriptedWorker;

use fleet_core::WorkerKind;
use fleet_supervisor::WorkerFactory;

/// Factory wired with the built-in worker kinds.
pub fn builtin_factory() -> WorkerFactory {
    let mut factory = WorkerFactory::new();
    factory.register(WorkerKind::Command, |_config| {
        Box::new(CommandWorker::new())
    });
    factory.register(WorkerKind::Scripted, |_config| {
        Box::new(ScriptedWorker::new(Vec::new()))
    });
    factory
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_factory_covers_all_kinds() {
        let factory = builtin_factory();
        let mut kinds = factory.kinds();
        kinds.sort_by_key(|k| k.as_str());
        assert_eq!(kinds, vec![WorkerKind::Command, WorkerKind::Scripted]);
    }
}
