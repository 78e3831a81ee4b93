use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod pid;

use sensor_relay::config::LoggingConfig;
use sensor_relay::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // start 在读完配置后按 [logging] 初始化
    let needs_early_tracing = !matches!(args.get_command(), cli::Commands::Start { .. });
    if needs_early_tracing {
        init_tracing(&LoggingConfig {
            level: "warn".to_string(),
            ..LoggingConfig::default()
        });
    }

    match args.get_command() {
        cli::Commands::Start { pid_file } => {
            commands::start::execute(&args.config, pid_file).await?;
        }
        cli::Commands::Stop {
            pid_file,
            force,
            timeout,
        } => {
            commands::stop::execute(pid_file, force, timeout).await?;
        }
        cli::Commands::Reload { pid_file } => {
            commands::reload::execute(pid_file).await?;
        }
        cli::Commands::Test => {
            commands::test::execute(&args.config)?;
        }
        cli::Commands::Send => {
            commands::send::execute(&args.config).await?;
        }
        cli::Commands::Backlog { action } => match action {
            cli::BacklogCommands::Show { json } => commands::backlog::show(&args.config, json).await?,
            cli::BacklogCommands::Flush => commands::backlog::flush(&args.config).await?,
        },
        cli::Commands::Version => {
            println!("sensor-relay v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
