//! Fleet Runtime
//!
//! This crate provides the orchestration core: the task store, the priority
//! message bus, the worker supervisor with its event relay, and the health
//! monitor, plus the HTTP surface the host application can mount.
//!
//! The store, bus, and supervisor are explicit values owned by the composing
//! application and passed around by `Arc` handle — there is no ambient global
//! state, so tests build fresh instances per case.

pub mod bus;
pub mod config;
pub mod health;
pub mod http;
pub mod metrics;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use bus::{FlowStat, MessageBus, MessageFilter};
pub use config::SupervisorConfig;
pub use health::HealthMonitor;
pub use http::AppState;
pub use store::{TaskEvent, TaskMetrics, TaskStore};
pub use supervisor::{HealthReport, Supervisor, SupervisorEvent, WorkerKey, WorkerSnapshot};
pub use worker::{Worker, WorkerContext, WorkerFactory};
