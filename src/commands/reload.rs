use anyhow::Result;
use colored::Colorize;
use std::path::PathBuf;

use crate::pid::PidFile;

#[cfg(unix)]
use nix::sys::signal::Signal;
#[cfg(unix)]
use sensor_relay::signals::send_signal_to_pid;

/// Execute the reload command
///
/// Sends SIGHUP; the relay reloads its configuration file and restarts its
/// schedule without exiting.
pub async fn execute(pid_file: Option<PathBuf>) -> Result<()> {
    #[cfg(not(unix))]
    {
        let _ = pid_file;
        anyhow::bail!("Reload command is not supported on this platform");
    }

    #[cfg(unix)]
    {
        let pid = PidFile::read(pid_file)?;

        println!(
            "{} {}",
            "Reloading configuration".yellow(),
            format!("(PID: {})", pid).cyan()
        );
        send_signal_to_pid(pid, Signal::SIGHUP)?;

        println!("{}", "  Reload signal sent".green());
        println!(
            "  {}",
            "Note: Check relay logs to verify reload succeeded".dimmed()
        );

        Ok(())
    }
}
