//! Runtime configuration.

/// Supervisor and health-monitor tuning knobs.
///
/// Defaults match the documented contract: a 60 second heartbeat window and
/// a 30 second health sweep. Auto-restart is opt-in.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Capacity of each worker's event channel.
    pub event_channel_capacity: usize,

    /// Capacity of the aggregated outbound broadcast stream.
    pub broadcast_capacity: usize,

    /// Heartbeat age beyond which a running worker counts as unhealthy
    /// (seconds).
    pub heartbeat_timeout_secs: u64,

    /// Health monitor sweep interval (seconds).
    pub health_interval_secs: u64,

    /// Pause between stop and relaunch during an explicit restart
    /// (milliseconds).
    pub restart_pause_ms: u64,

    /// Relaunch workers that enter status `error`.
    pub auto_restart: bool,

    /// First auto-restart delay (milliseconds); doubled per consecutive
    /// failure.
    pub restart_backoff_base_ms: u64,

    /// Ceiling on the auto-restart delay (milliseconds).
    pub restart_backoff_cap_ms: u64,

    /// Give up auto-restarting after this many consecutive failures.
    pub max_restart_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 256,
            broadcast_capacity: 1024,
            heartbeat_timeout_secs: 60,
            health_interval_secs: 30,
            restart_pause_ms: 500,
            auto_restart: false,
            restart_backoff_base_ms: 1_000,
            restart_backoff_cap_ms: 60_000,
            max_restart_attempts: 5,
        }
    }
}
