use std::path::PathBuf;
use std::process::ExitCode;

use cligate::{ConfigFile, GatewayManager};

#[tokio::main]
async fn main() -> ExitCode {
    let log_dir = std::env::var_os("CLIGATE_LOG_DIR").map(PathBuf::from);
    cligate::logging::init(log_dir.as_deref());

    let config_path = match std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("CLIGATE_CONFIG").map(PathBuf::from))
    {
        Some(path) => path,
        None => {
            eprintln!("usage: cligate <config.json> (or set CLIGATE_CONFIG)");
            return ExitCode::from(2);
        }
    };

    let config = match ConfigFile::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let mut manager = GatewayManager::new(&config);

    // Mirror the gateway event stream into the log so a headless run still
    // has per-request visibility.
    let mut events = manager.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    tracing::info!(channel = event.channel(), payload = %event.payload_json())
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("event log lagged, skipped {skipped} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let status = match manager.start() {
        Ok(status) => status,
        Err(err) => {
            tracing::error!("gateway failed to start: {err}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        "gateway listening on {}",
        status.base_url.as_deref().unwrap_or("-")
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to wait for shutdown signal: {err}");
    }

    tracing::info!("shutting down");
    manager.stop().await;
    ExitCode::SUCCESS
}
