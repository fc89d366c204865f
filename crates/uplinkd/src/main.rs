//! Multipath egress load balancer daemon.
//!
//! Takes no command-line arguments: starts, reconciles until signaled, and
//! exits 0 after removing its kernel state. Deployment (install/uninstall,
//! unit files) is handled by external tooling.

use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use uplinkd::{Config, MetricsCollector, ShellKernel, Supervisor, UplinkdError};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(e) = init_logging() {
        eprintln!("uplinkd: failed to initialize logging: {e}");
        return std::process::ExitCode::FAILURE;
    }

    info!("uplinkd: starting egress load balancer control plane");

    match run_daemon().await {
        Ok(()) => {
            info!("uplinkd: exiting normally");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "uplinkd: exiting with error");
            std::process::ExitCode::FAILURE
        }
    }
}

/// Initialize structured logging.
fn init_logging() -> uplinkd::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| UplinkdError::Config(format!("failed to set logger: {e}")))?;

    Ok(())
}

async fn run_daemon() -> uplinkd::Result<()> {
    let config = Config::load()?;

    let metrics = MetricsCollector::new()
        .map_err(|e| UplinkdError::Config(format!("failed to create metrics: {e}")))?;

    let kernel = Arc::new(ShellKernel::new());
    let ticks = uplinkd::netlink::spawn_observer()?;
    info!("uplinkd: route observer started");

    let mut supervisor = Supervisor::new(kernel, config, metrics);
    supervisor.run(ticks).await
}
