//! qdmetrics - Prometheus exporter for Qpid Dispatch router networks
//!
//! Connects to one router over AMQP management, discovers the network and
//! serves router statistics on `/metrics`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use qdmetrics_config::MetricsConfig;
use qdmetrics_exporter::{server, ScrapeHandler, ScrapeOrchestrator};
use qdmetrics_management::LinkSession;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod cli;

use cli::Cli;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load()?;
    let _log_guard = qdmetrics_telemetry::init(&config.log).context("failed to initialize logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        router = %config.connect.endpoint(),
        scrape_port = config.scrape,
        cache = config.cache,
        "starting qdmetrics"
    );

    if let Err(e) = run(config).await {
        error!(error = %format!("{e:#}"), "exporter failed");
        return Err(e);
    }
    Ok(())
}

async fn run(config: MetricsConfig) -> Result<()> {
    let scrape_port = config.scrape;
    let (stop_tx, stop_rx) = watch::channel(false);

    let orchestrator = Arc::new(ScrapeOrchestrator::new(LinkSession::tcp(), config));
    let runner = tokio::spawn(orchestrator.clone().run(stop_rx.clone()));

    let handler: Arc<dyn ScrapeHandler> = orchestrator;
    let mut server = tokio::spawn(server::serve(scrape_port, handler, stopped(stop_rx)));

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        result = &mut server => {
            let _ = stop_tx.send(true);
            result
                .context("scrape server task failed")?
                .context("scrape server stopped")?;
            return Ok(());
        }
    }

    let _ = stop_tx.send(true);
    match tokio::time::timeout(SHUTDOWN_GRACE, async { tokio::join!(runner, server) }).await {
        Ok((runner, server)) => {
            if let Ok(Err(e)) = runner {
                warn!(error = %e, "orchestrator stopped with an error");
            }
            if let Ok(Err(e)) = server {
                warn!(error = %e, "scrape server stopped with an error");
            }
        }
        Err(_) => warn!("shutdown did not complete in time"),
    }

    info!("qdmetrics stopped");
    Ok(())
}

/// Completes once the shutdown flag is raised or its sender is gone.
async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
