use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{error, info};

#[cfg(unix)]
use nix::sys::signal::Signal;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Tells a running scheduler to stop spawning ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// In-flight ticks finish, no new ones start
    Graceful,
}

/// What the process was asked to do from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// SIGTERM / SIGINT
    Shutdown,
    /// SIGHUP: reload configuration
    Reload,
}

/// Setup signal handlers for the relay process
///
/// Handles:
/// - SIGTERM/SIGINT: shutdown (the task exits after forwarding it)
/// - SIGHUP: configuration reload
#[cfg(unix)]
pub fn setup_signal_handlers() -> Result<(
    broadcast::Sender<ControlSignal>,
    tokio::task::JoinHandle<()>,
)> {
    let (control_tx, _) = broadcast::channel(16);
    let tx = control_tx.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    let _ = tx.send(ControlSignal::Shutdown);
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    let _ = tx.send(ControlSignal::Shutdown);
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    if tx.send(ControlSignal::Reload).is_err() {
                        error!("No listener for reload request");
                    }
                }
            }
        }
    });

    Ok((control_tx, handle))
}

/// Only Ctrl+C is available here; reload is not
#[cfg(not(unix))]
pub fn setup_signal_handlers() -> Result<(
    broadcast::Sender<ControlSignal>,
    tokio::task::JoinHandle<()>,
)> {
    let (control_tx, _) = broadcast::channel(16);
    let tx = control_tx.clone();

    let handle = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, shutting down");
                let _ = tx.send(ControlSignal::Shutdown);
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
    });

    Ok((control_tx, handle))
}

/// Send a signal to a process by PID (for stop/reload commands)
#[cfg(unix)]
pub fn send_signal_to_pid(pid: u32, signal: Signal) -> Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    info!("Sending signal {:?} to PID {}", signal, pid);

    kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| anyhow::anyhow!("Failed to send signal to PID {}: {}", pid, e))?;

    Ok(())
}

/// Check if a process is running
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // 不带信号的 kill 只做存在性检查
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    tracing::warn!("Process detection not implemented for this platform");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setup_signal_handlers() {
        let (control_tx, handle) = setup_signal_handlers().unwrap();
        let mut rx = control_tx.subscribe();

        control_tx.send(ControlSignal::Reload).unwrap();
        assert_eq!(rx.recv().await.unwrap(), ControlSignal::Reload);

        handle.abort();
    }

    #[cfg(unix)]
    #[test]
    fn test_send_signal_to_current_process() {
        // SIGCONT to ourselves is harmless
        let result = send_signal_to_pid(std::process::id(), Signal::SIGCONT);
        assert!(result.is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_send_signal_to_nonexistent_process() {
        let result = send_signal_to_pid(999_999, Signal::SIGTERM);
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_is_process_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(999_999));
    }
}
