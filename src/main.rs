//! Process entrypoint: loads the configuration, runs the
//! pipeline until interrupted, then drains.

use log::{error, info};

use artnet_hue_bridge::config;
use artnet_hue_bridge::coordinator::Coordinator;
use artnet_hue_bridge::status::RuntimeStatus;

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());

    let config = match config::load(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load {config_path}: {e}");
            std::process::exit(1);
        }
    };

    let status = RuntimeStatus::new();
    let coordinator = match Coordinator::new(config, status).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    if coordinator.hub_count() == 0 {
        error!("no hub passed configuration validation, nothing to run");
        std::process::exit(1);
    }

    info!("running with {} hub(s), ctrl-c to stop", coordinator.hub_count());
    if let Err(e) = wait_for_shutdown_signal().await {
        error!("error waiting for shutdown signal: {e}");
    }

    info!("shutting down");
    let clean = coordinator.shutdown().await;
    std::process::exit(if clean { 0 } else { 1 });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
