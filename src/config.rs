use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::record::Metric;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub delivery: DeliveryConfig,
    /// metric id -> enabled
    #[serde(default)]
    pub sensors: BTreeMap<String, bool>,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub backlog: BacklogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    /// Send interval; ticks align to multiples of this many minutes past midnight
    #[serde(default = "default_send_freq_minutes")]
    pub send_freq_minutes: u32,

    /// Fire one extra tick as soon as the relay starts
    #[serde(default = "default_true")]
    pub send_on_start: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            send_freq_minutes: default_send_freq_minutes(),
            send_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeliveryConfig {
    pub webhook_url: String,
    pub auth_key: String,

    /// Query parameter name carrying `auth_key`
    #[serde(default = "default_auth_param")]
    pub auth_param: String,

    #[serde(default = "default_delivery_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_url")]
    pub base_url: String,

    /// Poll period requested for each subscription
    #[serde(default = "default_subscription_period_ms")]
    pub subscription_period_ms: u64,

    #[serde(default = "default_bus_timeout")]
    pub timeout_seconds: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            base_url: default_bus_url(),
            subscription_period_ms: default_subscription_period_ms(),
            timeout_seconds: default_bus_timeout(),
        }
    }
}

/// Backlog storage and retention
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BacklogConfig {
    #[serde(default = "default_backlog_path")]
    pub path: PathBuf,

    /// Oldest entries beyond this count are evicted on append (0 = unlimited)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Entries older than this are evicted on append (0 = unlimited)
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            path: default_backlog_path(),
            max_entries: default_max_entries(),
            max_age_hours: default_max_age_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Prometheus exporter settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_telemetry_listen")]
    pub listen: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_telemetry_listen(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_send_freq_minutes() -> u32 {
    10
}

fn default_auth_param() -> String {
    "key".to_string()
}

fn default_delivery_timeout() -> u64 {
    30
}

fn default_bus_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_subscription_period_ms() -> u64 {
    1000
}

fn default_bus_timeout() -> u64 {
    5
}

fn default_backlog_path() -> PathBuf {
    PathBuf::from("./data/backlog.json")
}

fn default_max_entries() -> usize {
    10000
}

fn default_max_age_hours() -> u64 {
    168
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_telemetry_listen() -> String {
    "127.0.0.1:9464".to_string()
}

impl Config {
    /// Enabled metrics in declaration order
    ///
    /// Unknown ids are skipped here; `validate_config` rejects them at load time.
    pub fn enabled_metrics(&self) -> Vec<Metric> {
        Metric::ALL
            .iter()
            .copied()
            .filter(|m| self.sensors.get(m.id()).copied().unwrap_or(false))
            .collect()
    }
}

/// Load configuration from `path` layered with `SENSOR_RELAY__*` environment variables
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("SENSOR_RELAY").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.schedule.send_freq_minutes < 1 {
        anyhow::bail!("schedule.send_freq_minutes must be >= 1");
    }

    let url = url::Url::parse(&cfg.delivery.webhook_url)
        .map_err(|e| anyhow::anyhow!("delivery.webhook_url is not a valid URL: {}", e))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!(
            "delivery.webhook_url must use http or https, got '{}'",
            url.scheme()
        );
    }
    if cfg.delivery.auth_key.is_empty() {
        anyhow::bail!("delivery.auth_key cannot be empty");
    }
    if cfg.delivery.auth_param.is_empty() {
        anyhow::bail!("delivery.auth_param cannot be empty");
    }
    if cfg.delivery.timeout_seconds < 1 {
        anyhow::bail!("delivery.timeout_seconds must be >= 1");
    }

    for id in cfg.sensors.keys() {
        if Metric::from_id(id).is_none() {
            let known: Vec<&str> = Metric::ALL.iter().map(|m| m.id()).collect();
            anyhow::bail!("Unknown sensor '{}' (known: {})", id, known.join(", "));
        }
    }
    if cfg.enabled_metrics().is_empty() {
        anyhow::bail!("At least one sensor must be enabled");
    }

    if cfg.bus.subscription_period_ms == 0 {
        anyhow::bail!("bus.subscription_period_ms must be > 0");
    }
    if cfg.bus.timeout_seconds < 1 {
        anyhow::bail!("bus.timeout_seconds must be >= 1");
    }
    url::Url::parse(&cfg.bus.base_url)
        .map_err(|e| anyhow::anyhow!("bus.base_url is not a valid URL: {}", e))?;

    match cfg.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("logging.format must be 'text' or 'json', got '{}'", other),
    }

    if cfg.telemetry.enabled {
        cfg.telemetry
            .listen
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("telemetry.listen is not a socket address: {}", e))?;
    }

    Ok(())
}
