use chrono::Local;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backlog::{Backlog, DrainReport};
use crate::delivery::Deliver;
use crate::error::{DeliveryError, StorageError};
use crate::record::{Metric, Observation, Record};
use crate::sample_store::SampleStore;

/// What happened on one tick
#[derive(Debug)]
pub enum TickOutcome {
    /// Fresh record confirmed; `drain` is the backlog resend that followed
    Delivered {
        record: Record,
        drain: Result<DrainReport, StorageError>,
    },
    /// Fresh record failed and was handed to the backlog
    Failed {
        record: Record,
        error: DeliveryError,
        backlog: Result<usize, StorageError>,
    },
}

impl TickOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, TickOutcome::Delivered { .. })
    }

    pub fn record(&self) -> &Record {
        match self {
            TickOutcome::Delivered { record, .. } | TickOutcome::Failed { record, .. } => record,
        }
    }
}

/// Per-run relay state: everything a tick needs
///
/// Created when the relay starts and dropped when it stops. Ticks may run
/// concurrently against the same instance.
pub struct Reconciler<D> {
    metrics: Vec<Metric>,
    store: SampleStore,
    backlog: Backlog,
    client: D,
    connected: AtomicBool,
}

impl<D: Deliver> Reconciler<D> {
    pub fn new(metrics: Vec<Metric>, store: SampleStore, backlog: Backlog, client: D) -> Self {
        Self {
            metrics,
            store,
            backlog,
            client,
            connected: AtomicBool::new(false),
        }
    }

    /// Outcome of the most recent delivery attempt (advisory only)
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    pub fn client(&self) -> &D {
        &self.client
    }

    pub fn enabled_metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Snapshot of every enabled metric plus the current local time
    pub async fn build_record(&self) -> Record {
        let mut record = Record::new(&Local::now());
        for &metric in &self.metrics {
            let observation = match self.store.read(metric).await {
                Some(observation) => observation,
                None => {
                    tracing::debug!(metric = %metric, "No value observed yet");
                    Observation::absent()
                }
            };
            record.insert(metric, observation);
        }
        record
    }

    /// One sample-and-send cycle
    ///
    /// Always attempts delivery, whatever the previous outcome was.
    pub async fn tick(&self) -> TickOutcome {
        crate::telemetry::record_tick();
        let record = self.build_record().await;

        match self.client.deliver(&record).await {
            Ok(_) => {
                self.set_connected(true);
                crate::telemetry::record_delivery("fresh", true);
                tracing::info!(datetime = %record.datetime, "Record delivered");

                let drain = self.flush().await;
                TickOutcome::Delivered { record, drain }
            }
            Err(error) => {
                self.set_connected(false);
                crate::telemetry::record_delivery("fresh", false);
                tracing::warn!(
                    datetime = %record.datetime,
                    error = %error,
                    "Delivery failed, saving record to backlog"
                );

                let backlog = self.backlog.append(record.clone()).await;
                match &backlog {
                    Ok(len) => tracing::info!(backlog = *len, "Record saved to backlog"),
                    Err(e) => tracing::error!(
                        error = %e,
                        datetime = %record.datetime,
                        "Failed to persist undelivered record"
                    ),
                }

                TickOutcome::Failed {
                    record,
                    error,
                    backlog,
                }
            }
        }
    }

    /// Resend the backlog with the same client
    pub async fn flush(&self) -> Result<DrainReport, StorageError> {
        let client = &self.client;
        let result = self
            .backlog
            .drain_attempt(|record| async move { client.deliver(&record).await })
            .await;

        match &result {
            Ok(report) if report.is_noop() => {}
            Ok(report) => tracing::info!(
                delivered = report.delivered,
                remaining = report.remaining,
                "Backlog drained"
            ),
            Err(e) => tracing::error!(error = %e, "Failed to rewrite backlog after resend"),
        }

        result
    }

    fn set_connected(&self, connected: bool) {
        let previous = self.connected.swap(connected, Ordering::AcqRel);
        if previous != connected {
            if connected {
                tracing::info!("Endpoint reachable again");
            } else {
                tracing::warn!("Endpoint unreachable");
            }
        }
        crate::telemetry::record_connected(connected);
    }
}
