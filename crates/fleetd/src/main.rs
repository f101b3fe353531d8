//! Fleet Daemon
//!
//! Wires together the task store, message bus, worker supervisor, and health
//! monitor, and serves the HTTP/SSE surface for dashboards and tooling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fleet_supervisor::{
    http, AppState, HealthMonitor, MessageBus, Supervisor, SupervisorConfig, TaskStore,
};
use fleet_workers::builtin_factory;

#[derive(Debug, Parser)]
#[command(name = "fleetd", about = "Fleet worker supervisor daemon")]
struct Args {
    /// HTTP bind address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Health sweep interval in seconds.
    #[arg(long, default_value_t = 30)]
    health_interval_secs: u64,

    /// Heartbeat age after which a running worker counts as unhealthy
    /// (seconds).
    #[arg(long, default_value_t = 60)]
    heartbeat_timeout_secs: u64,

    /// Relaunch workers that enter status error, with bounded backoff.
    #[arg(long)]
    auto_restart: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = SupervisorConfig {
        heartbeat_timeout_secs: args.heartbeat_timeout_secs,
        health_interval_secs: args.health_interval_secs,
        auto_restart: args.auto_restart,
        ..SupervisorConfig::default()
    };

    // Shared state: explicit values, passed by handle.
    let store = Arc::new(TaskStore::new());
    let bus = Arc::new(MessageBus::new());
    let supervisor = Supervisor::new(
        builtin_factory(),
        Some(store.clone()),
        Some(bus.clone()),
        config.clone(),
    );

    let shutdown = CancellationToken::new();
    let monitor = HealthMonitor::new(
        supervisor.clone(),
        Duration::from_secs(config.health_interval_secs),
    );
    let monitor_handle = monitor.spawn(shutdown.clone());

    let state = AppState {
        store,
        bus,
        supervisor: supervisor.clone(),
    };
    let router = http::router(state);

    let listener = TcpListener::bind(args.bind).await?;
    info!(addr = %args.bind, "fleetd listening");

    tokio::select! {
        result = axum::serve(listener, router) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    shutdown.cancel();
    supervisor.stop_all().await;
    let _ = monitor_handle.await;
    Ok(())
}
