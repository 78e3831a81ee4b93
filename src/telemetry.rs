use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::config::TelemetryConfig;

/// Install the Prometheus exporter if enabled
///
/// Without an installed recorder the `record_*` calls below are no-ops.
pub fn init_metrics(config: &TelemetryConfig) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.listen.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    init_metric_descriptions();
    tracing::info!(listen = %addr, "Prometheus exporter listening");

    Ok(())
}

fn init_metric_descriptions() {
    describe_counter!("relay_ticks_total", "Total number of sample-and-send cycles");
    describe_counter!(
        "relay_deliveries_total",
        "Delivery attempts by outcome (fresh and backlog resends)"
    );
    describe_gauge!("relay_backlog_entries", "Records waiting in the backlog");
    describe_counter!(
        "relay_backlog_evicted_total",
        "Backlog entries dropped by the retention policy"
    );
    describe_gauge!(
        "relay_connected",
        "Outcome of the most recent delivery (1=delivered, 0=failed)"
    );

    gauge!("relay_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

pub fn record_tick() {
    counter!("relay_ticks_total").increment(1);
}

/// `source` is "fresh" or "backlog"
pub fn record_delivery(source: &'static str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("relay_deliveries_total", "source" => source, "outcome" => outcome).increment(1);
}

pub fn record_backlog_len(len: usize) {
    gauge!("relay_backlog_entries").set(len as f64);
}

pub fn record_evicted(count: usize) {
    counter!("relay_backlog_evicted_total").increment(count as u64);
}

pub fn record_connected(connected: bool) {
    gauge!("relay_connected").set(if connected { 1.0 } else { 0.0 });
}
