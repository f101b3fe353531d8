//! Health monitor - periodic liveness sweeps over the worker registry.
//!
//! The monitor only observes and notifies; remediation is the caller's
//! responsibility.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use crate::supervisor::HealthReport;
use crate::supervisor::{Supervisor, SupervisorEvent, WorkerKey};

/// Sweeps the supervisor's registry on a fixed interval and raises a
/// [`SupervisorEvent::HealthAlert`] whenever the unhealthy bucket grows
/// relative to the previous sweep.
pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    interval: Duration,
    seen_unhealthy: HashSet<WorkerKey>,
}

impl HealthMonitor {
    /// Create a monitor sweeping at the given interval.
    pub fn new(supervisor: Arc<Supervisor>, interval: Duration) -> Self {
        Self {
            supervisor,
            interval,
            seen_unhealthy: HashSet::new(),
        }
    }

    /// Run sweeps until the token fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }

    /// Spawn the monitor onto the runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// One sweep: classify every worker and alert on newly-unhealthy ones.
    /// Exposed so hosts can drive sweeps manually.
    pub fn sweep(&mut self) -> HealthReport {
        let report = self.supervisor.health_check();

        let current: HashSet<WorkerKey> = report.unhealthy.iter().cloned().collect();
        let newly_unhealthy: Vec<WorkerKey> = current
            .iter()
            .filter(|key| !self.seen_unhealthy.contains(*key))
            .cloned()
            .collect();

        if !newly_unhealthy.is_empty() {
            warn!(
                count = newly_unhealthy.len(),
                "Workers became unhealthy since last sweep"
            );
            self.supervisor.publish(SupervisorEvent::HealthAlert {
                unhealthy: newly_unhealthy,
            });
        } else {
            debug!(
                healthy = report.healthy.len(),
                unhealthy = report.unhealthy.len(),
                stopped = report.stopped.len(),
                "Health sweep"
            );
        }

        self.seen_unhealthy = current;
        report
    }
}
