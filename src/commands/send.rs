use anyhow::{bail, Result};
use colored::Colorize;
use sensor_relay::bus::{DataBus, HttpBus};
use sensor_relay::config;
use sensor_relay::reconciler::TickOutcome;
use sensor_relay::relay::build_reconciler;
use std::path::Path;
use std::sync::Arc;

/// Execute the send command
///
/// One tick against the live bus (direct queries only) and endpoint. A
/// failed record is backlogged exactly as the running relay would.
pub async fn execute(config_path: &Path) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    let bus: Arc<dyn DataBus> = Arc::new(HttpBus::new(&cfg.bus)?);
    let reconciler = build_reconciler(&cfg, bus)?;

    println!(
        "{} {}",
        "Sending to".yellow(),
        reconciler.client().display_endpoint().cyan()
    );

    match reconciler.tick().await {
        TickOutcome::Delivered { record, drain } => {
            println!("{} {}", "✓ Delivered".green(), record.datetime);
            println!("{}", serde_json::to_string_pretty(&record)?);
            match drain {
                Ok(report) if report.is_noop() => {}
                Ok(report) => println!(
                    "  Backlog: {} resent, {} remaining",
                    report.delivered, report.remaining
                ),
                Err(e) => println!("  {} {}", "Backlog rewrite failed:".red(), e),
            }
            Ok(())
        }
        TickOutcome::Failed {
            record,
            error,
            backlog,
        } => {
            println!("{} {}", "✗ Delivery failed:".red(), error);
            match backlog {
                Ok(len) => println!("  Saved to backlog ({} waiting)", len),
                Err(e) => println!("  {} {}", "Could not save to backlog:".red(), e),
            }
            bail!("Record {} was not delivered", record.datetime)
        }
    }
}
