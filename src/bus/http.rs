use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use super::{BusValue, DataBus, Delta, PathValue, Subscription, SubscriptionHandle};
use crate::config::BusConfig;
use crate::error::BusError;

/// Signal K REST adapter
///
/// Direct queries map `a.b.c` to `GET {base}/signalk/v1/api/vessels/self/a/b/c`.
/// Subscriptions are served by polling those endpoints every `period`; paths
/// sharing a period are fetched by one task and forwarded as a single delta.
#[derive(Clone)]
pub struct HttpBus {
    client: Client,
    base_url: String,
}

impl HttpBus {
    pub fn new(config: &BusConfig) -> Result<Self, BusError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| BusError::Subscribe {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn value_url(&self, path: &str) -> String {
        format!(
            "{}/signalk/v1/api/vessels/self/{}",
            self.base_url,
            path.replace('.', "/")
        )
    }

    async fn fetch(&self, path: &str) -> Result<Option<BusValue>, BusError> {
        let query_error = |message: String| BusError::Query {
            path: path.to_string(),
            message,
        };

        let response = self
            .client
            .get(self.value_url(path))
            .send()
            .await
            .map_err(|e| query_error(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(query_error(format!("status {}", response.status())));
        }

        let value = response
            .json::<BusValue>()
            .await
            .map_err(|e| query_error(e.to_string()))?;
        Ok(Some(value))
    }

    /// Poll `paths` forever, pushing one delta per round that produced values
    async fn poll_loop(
        self,
        paths: Vec<String>,
        period: Duration,
        sink: mpsc::Sender<Delta>,
        active: Arc<AtomicBool>,
    ) {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while active.load(Ordering::Acquire) {
            timer.tick().await;

            let mut values = Vec::with_capacity(paths.len());
            for path in &paths {
                match self.fetch(path).await {
                    Ok(Some(found)) => values.push(PathValue {
                        path: path.clone(),
                        value: found.value,
                    }),
                    Ok(None) => {}
                    Err(e) => tracing::debug!(error = %e, "Bus poll failed"),
                }
            }

            if values.is_empty() {
                continue;
            }
            if sink.send(Delta::from_values(values)).await.is_err() {
                tracing::debug!("Delta receiver closed, stopping bus poller");
                break;
            }
        }
    }
}

#[async_trait]
impl DataBus for HttpBus {
    async fn subscribe(
        &self,
        subscriptions: Vec<Subscription>,
        sink: mpsc::Sender<Delta>,
    ) -> Result<SubscriptionHandle, BusError> {
        if subscriptions.is_empty() {
            return Err(BusError::Subscribe {
                message: "empty subscription batch".to_string(),
            });
        }

        // Probe the discovery endpoint so an unreachable server is reported now
        let discovery = format!("{}/signalk", self.base_url);
        match self.client.get(&discovery).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                return Err(BusError::Subscribe {
                    message: format!("{} answered {}", discovery, response.status()),
                });
            }
            Err(e) => {
                return Err(BusError::Subscribe {
                    message: format!("{} unreachable: {}", discovery, e),
                });
            }
        }

        let mut by_period: BTreeMap<Duration, Vec<String>> = BTreeMap::new();
        for sub in subscriptions {
            by_period.entry(sub.period).or_default().push(sub.path);
        }

        let active = Arc::new(AtomicBool::new(true));
        let tasks = by_period
            .into_iter()
            .map(|(period, paths)| {
                tracing::debug!(period_ms = period.as_millis() as u64, paths = paths.len(), "Starting bus poller");
                tokio::spawn(self.clone().poll_loop(paths, period, sink.clone(), active.clone()))
            })
            .collect();

        Ok(SubscriptionHandle::new(active, tasks))
    }

    async fn get_value(&self, path: &str) -> Option<BusValue> {
        match self.fetch(path).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Direct bus query failed");
                None
            }
        }
    }
}
