use anyhow::{bail, Result};
use colored::Colorize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::info;

use crate::pid::PidFile;

#[cfg(unix)]
use nix::sys::signal::Signal;
#[cfg(unix)]
use sensor_relay::signals::{is_process_running, send_signal_to_pid};

/// Execute the stop command
///
/// SIGTERM the relay from the PID file, wait up to `timeout` seconds for it
/// to exit, then SIGKILL if `force` is set.
pub async fn execute(pid_file: Option<PathBuf>, force: bool, timeout: u64) -> Result<()> {
    #[cfg(not(unix))]
    {
        let _ = (pid_file, force, timeout);
        bail!("Stop command is not supported on this platform");
    }

    #[cfg(unix)]
    {
        let pid = PidFile::read(pid_file)?;

        println!("{} {}", "Stopping relay".yellow(), format!("(PID: {})", pid).cyan());
        send_signal_to_pid(pid, Signal::SIGTERM)?;
        println!("  Sent SIGTERM, waiting for shutdown...");

        let start = Instant::now();
        let timeout_duration = Duration::from_secs(timeout);

        while start.elapsed() < timeout_duration {
            if !is_process_running(pid) {
                println!("{}", "  Relay stopped".green());
                info!("Relay stopped (PID {})", pid);
                return Ok(());
            }
            sleep(Duration::from_millis(500)).await;
        }

        if !force {
            bail!(
                "Timeout after {} seconds. Use --force to kill immediately.",
                timeout
            );
        }

        println!("{}", "  Timeout reached, force killing...".red());
        send_signal_to_pid(pid, Signal::SIGKILL)?;
        sleep(Duration::from_secs(1)).await;

        if is_process_running(pid) {
            bail!("Failed to kill process even with SIGKILL");
        }
        println!("{}", "  Relay force stopped".yellow());
        Ok(())
    }
}
