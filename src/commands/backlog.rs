use anyhow::Result;
use colored::Colorize;
use sensor_relay::backlog::Backlog;
use sensor_relay::bus::{DataBus, HttpBus};
use sensor_relay::config;
use sensor_relay::relay::build_reconciler;
use std::path::Path;
use std::sync::Arc;

/// List backlogged records, oldest first
pub async fn show(config_path: &Path, json: bool) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    let backlog = Backlog::from_config(&cfg.backlog);
    let entries = backlog.entries().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!(
        "{} {} ({})",
        "Backlog".bold(),
        backlog.path().display(),
        format!("{} records", entries.len()).cyan()
    );
    for record in &entries {
        let observed = record
            .observations
            .values()
            .filter(|o| !o.value.is_null())
            .count();
        println!(
            "  {}  {}/{} values",
            record.datetime,
            observed,
            record.observations.len()
        );
    }

    Ok(())
}

/// Resend every backlogged record now
pub async fn flush(config_path: &Path) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    let bus: Arc<dyn DataBus> = Arc::new(HttpBus::new(&cfg.bus)?);
    let reconciler = build_reconciler(&cfg, bus)?;

    let report = reconciler.flush().await?;
    if report.is_noop() {
        println!("{}", "Backlog is empty".green());
        return Ok(());
    }

    let summary = format!(
        "{} of {} delivered, {} remaining",
        report.delivered, report.attempted, report.remaining
    );
    if report.remaining == 0 {
        println!("{} {}", "✓".green(), summary);
    } else {
        println!("{} {}", "!".yellow(), summary);
    }

    Ok(())
}
