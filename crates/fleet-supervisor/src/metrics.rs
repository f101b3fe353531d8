//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use fleet_core::{TaskStatus, WorkerStatus};

use crate::bus::MessageBus;
use crate::store::TaskStore;
use crate::supervisor::Supervisor;

/// Collect all metrics and format as Prometheus text.
pub fn collect_metrics(store: &TaskStore, bus: &MessageBus, supervisor: &Supervisor) -> String {
    let mut output = String::new();

    collect_worker_metrics(supervisor, &mut output);
    collect_task_metrics(store, &mut output);
    collect_bus_metrics(bus, &mut output);

    output
}

/// Worker counts by registry status.
fn collect_worker_metrics(supervisor: &Supervisor, output: &mut String) {
    let mut starting = 0u64;
    let mut running = 0u64;
    let mut stopping = 0u64;
    let mut stopped = 0u64;
    let mut error = 0u64;

    for snapshot in supervisor.list_all() {
        match snapshot.status {
            WorkerStatus::Starting => starting += 1,
            WorkerStatus::Running => running += 1,
            WorkerStatus::Stopping => stopping += 1,
            WorkerStatus::Stopped => stopped += 1,
            WorkerStatus::Error => error += 1,
        }
    }

    writeln!(
        output,
        "# HELP fleet_workers Number of registered workers by status"
    )
    .ok();
    writeln!(output, "# TYPE fleet_workers gauge").ok();
    writeln!(output, "fleet_workers{{status=\"starting\"}} {starting}").ok();
    writeln!(output, "fleet_workers{{status=\"running\"}} {running}").ok();
    writeln!(output, "fleet_workers{{status=\"stopping\"}} {stopping}").ok();
    writeln!(output, "fleet_workers{{status=\"stopped\"}} {stopped}").ok();
    writeln!(output, "fleet_workers{{status=\"error\"}} {error}").ok();
}

/// Task counts by status plus the store's aggregate counters.
fn collect_task_metrics(store: &TaskStore, output: &mut String) {
    writeln!(output).ok();
    writeln!(output, "# HELP fleet_tasks Number of tasks by status").ok();
    writeln!(output, "# TYPE fleet_tasks gauge").ok();
    for status in TaskStatus::ALL {
        let count = store.tasks_by_status(status).len();
        writeln!(output, "fleet_tasks{{status=\"{status}\"}} {count}").ok();
    }

    let metrics = store.metrics();
    writeln!(output).ok();
    writeln!(output, "# HELP fleet_tasks_created_total Tasks ever created").ok();
    writeln!(output, "# TYPE fleet_tasks_created_total counter").ok();
    writeln!(output, "fleet_tasks_created_total {}", metrics.total_created).ok();
    writeln!(output, "# HELP fleet_tasks_completed_total Tasks completed").ok();
    writeln!(output, "# TYPE fleet_tasks_completed_total counter").ok();
    writeln!(
        output,
        "fleet_tasks_completed_total {}",
        metrics.total_completed
    )
    .ok();
    writeln!(output, "# HELP fleet_tasks_failed_total Task failures").ok();
    writeln!(output, "# TYPE fleet_tasks_failed_total counter").ok();
    writeln!(output, "fleet_tasks_failed_total {}", metrics.total_failed).ok();
    writeln!(
        output,
        "# HELP fleet_task_completion_ms_avg Running mean completion time"
    )
    .ok();
    writeln!(output, "# TYPE fleet_task_completion_ms_avg gauge").ok();
    writeln!(
        output,
        "fleet_task_completion_ms_avg {}",
        metrics.average_completion_ms
    )
    .ok();
}

/// Queued message depth on the bus.
fn collect_bus_metrics(bus: &MessageBus, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP fleet_messages_queued Messages queued and not yet delivered"
    )
    .ok();
    writeln!(output, "# TYPE fleet_messages_queued gauge").ok();
    writeln!(output, "fleet_messages_queued {}", bus.queued_total()).ok();
}
