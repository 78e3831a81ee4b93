use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use sensor_relay::signals::is_process_running;

const DEFAULT_PID_PATH: &str = "./sensor-relay.pid";

/// PID file with an exclusive lock
///
/// Two relays sharing one backlog file would race on it, so a second
/// `start` against the same PID file is refused.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Create, lock and write the current PID
    ///
    /// A lock held by a process that no longer exists is taken over.
    pub fn create(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_PID_PATH));

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create PID file directory: {:?}", parent))?;
        }

        // 不截断：加锁失败时还要读旧 PID
        #[allow(clippy::suspicious_open_options)]
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open PID file: {:?}", path))?;

        if file.try_lock_exclusive().is_err() {
            let old_pid = Self::read_pid_from_file(&mut file)
                .context("Failed to read PID from locked file")?;
            if is_process_running(old_pid) {
                bail!(
                    "Relay already running (PID: {}). Use 'sensor-relay stop' first.",
                    old_pid
                );
            }
            warn!("Taking over stale PID file (old PID: {} is not running)", old_pid);
            file.lock_exclusive()
                .context("Failed to acquire lock even after detecting stale PID")?;
        }
        info!("Acquired PID file lock: {:?}", path);

        let pid = std::process::id();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", pid)?;
        file.flush()?;

        Ok(PidFile { path, file })
    }

    /// Read the PID of a running relay (for stop/reload)
    pub fn read(path: Option<PathBuf>) -> Result<u32> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_PID_PATH));

        if !path.exists() {
            bail!("PID file not found: {:?}. Is the relay running?", path);
        }

        let mut file =
            File::open(&path).with_context(|| format!("Failed to open PID file: {:?}", path))?;

        Self::read_pid_from_file(&mut file)
    }

    fn read_pid_from_file(file: &mut File) -> Result<u32> {
        file.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        contents
            .trim()
            .parse::<u32>()
            .with_context(|| format!("Invalid PID in file: '{}'", contents.trim()))
    }

    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to unlock PID file: {}", e);
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove PID file {:?}: {}", self.path, e);
        } else {
            info!("PID file removed: {:?}", self.path);
        }
    }
}
