use anyhow::Result;
use colored::Colorize;
use sensor_relay::bus::{DataBus, HttpBus};
use sensor_relay::config::{self, Config};
use sensor_relay::signals::{setup_signal_handlers, ControlSignal};
use sensor_relay::{init_tracing, telemetry, Relay};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::pid::PidFile;

/// Execute the start command
///
/// This will:
/// 1. Load configuration and initialize logging from it
/// 2. Create PID file
/// 3. Start the relay and block until SIGTERM/SIGINT
///
/// SIGHUP swaps in a freshly loaded configuration; an invalid one is
/// rejected and the running relay keeps going.
pub async fn execute(config_path: &Path, pid_file: Option<PathBuf>) -> Result<()> {
    println!("{}", "Starting sensor relay in foreground mode...".green());

    let mut cfg = config::load_config(config_path)?;
    init_tracing(&cfg.logging);
    telemetry::init_metrics(&cfg.telemetry)?;

    let _pid_file = PidFile::create(pid_file)?;

    let (control_tx, signal_task) = setup_signal_handlers()?;
    let mut control_rx = control_tx.subscribe();

    let mut relay = start_relay(&cfg).await?;
    info!(config = %config_path.display(), "Relay running");

    loop {
        match control_rx.recv().await {
            Ok(ControlSignal::Shutdown) | Err(RecvError::Closed) => break,
            Ok(ControlSignal::Reload) => {
                (relay, cfg) = reload(config_path, relay, cfg).await?;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed control signals");
            }
        }
    }

    relay.stop().await;
    signal_task.abort();
    info!("Shutdown complete");

    Ok(())
}

async fn start_relay(cfg: &Config) -> Result<Relay> {
    let bus: Arc<dyn DataBus> = Arc::new(HttpBus::new(&cfg.bus)?);
    Relay::start(cfg, bus).await
}

/// Restart the relay on the configuration at `config_path`
///
/// Falls back to `current_cfg` if the new one does not load or start.
async fn reload(config_path: &Path, current: Relay, current_cfg: Config) -> Result<(Relay, Config)> {
    let new_cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Rejecting reload, keeping current configuration");
            return Ok((current, current_cfg));
        }
    };

    if new_cfg.logging.level != current_cfg.logging.level
        || new_cfg.logging.format != current_cfg.logging.format
        || new_cfg.telemetry.enabled != current_cfg.telemetry.enabled
        || new_cfg.telemetry.listen != current_cfg.telemetry.listen
    {
        warn!("[logging] and [telemetry] changes take effect on restart only");
    }

    current.stop().await;

    match start_relay(&new_cfg).await {
        Ok(relay) => {
            info!("Configuration reloaded");
            Ok((relay, new_cfg))
        }
        Err(e) => {
            error!(error = %e, "New configuration failed to start, restoring previous one");
            let relay = start_relay(&current_cfg).await?;
            Ok((relay, current_cfg))
        }
    }
}
