//! Locker Service (lockersrv)
//!
//! Connects to the configured controller, polls lock status and logs every
//! update as JSON until interrupted.

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use lockersrv::bootstrap::Args;
use lockersrv::logging::init_logging;
use lockersrv::LockerService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    // Keep the guard alive so the file writer flushes on exit
    let _log_guard = init_logging(&config.logging, args.log_level.as_deref(), !args.no_color)?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    info!(
        "lockersrv {} starting, controller {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.controller.host,
        config.controller.port
    );

    let service = LockerService::new(&config);
    let mut updates = service.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => match serde_json::to_string(&update) {
                    Ok(json) => info!(target: "lockersrv::status", "{}", json),
                    Err(e) => warn!("Failed to serialize status update: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Status logger lagged, {} update(s) skipped", skipped);
                },
                Err(RecvError::Closed) => break,
            }
        }
    });

    if !service.start().await {
        warn!("Controller unreachable at startup, reconnecting in background");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    service.stop().await;
    logger.abort();

    let session = service.session_stats();
    let poller = service.poller_stats();
    info!(
        "lockersrv stopped: {} connect(s), {} status request(s), {} update(s) published",
        session.connects, poller.requests_sent, poller.statuses_published
    );
    Ok(())
}
