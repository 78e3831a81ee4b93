use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sensor-relay", version, about = "Sensor bus to webhook relay")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the relay in the foreground (default)
    Start {
        /// Path to PID file
        #[arg(short, long)]
        pid_file: Option<PathBuf>,
    },

    /// Stop a running relay
    Stop {
        /// Path to PID file
        #[arg(short, long)]
        pid_file: Option<PathBuf>,

        /// Force kill if graceful shutdown times out
        #[arg(short, long)]
        force: bool,

        /// Timeout in seconds for graceful shutdown
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Reload configuration without restarting (sends SIGHUP)
    Reload {
        /// Path to PID file
        #[arg(short, long)]
        pid_file: Option<PathBuf>,
    },

    /// Test configuration file validity
    Test,

    /// Sample and send one record now
    Send,

    /// Inspect or resend the local backlog
    Backlog {
        #[command(subcommand)]
        action: BacklogCommands,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum BacklogCommands {
    /// List records waiting to be resent
    Show {
        /// Print the raw JSON entries
        #[arg(long)]
        json: bool,
    },

    /// Resend every backlogged record now
    Flush,
}

impl Cli {
    /// Get the command to execute, defaulting to Start if none provided
    pub fn get_command(&self) -> Commands {
        self.command
            .clone()
            .unwrap_or(Commands::Start { pid_file: None })
    }
}
