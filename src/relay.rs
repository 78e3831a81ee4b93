//! Relay lifecycle
//!
//! `Relay::start` wires the bus, sample store, backlog, delivery client and
//! scheduler together around one [`Reconciler`]; `Relay::stop` tears all of
//! it down again. Nothing outlives a stopped relay except the backlog file.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::backlog::Backlog;
use crate::bus::{DataBus, Subscription, SubscriptionHandle};
use crate::config::Config;
use crate::delivery::DeliveryClient;
use crate::reconciler::Reconciler;
use crate::sample_store::SampleStore;
use crate::scheduler::Scheduler;
use crate::signals::ShutdownSignal;

const DELTA_CHANNEL_CAPACITY: usize = 256;

/// Build the per-run context for `config` without starting anything
pub fn build_reconciler(
    config: &Config,
    bus: Arc<dyn DataBus>,
) -> anyhow::Result<Reconciler<DeliveryClient>> {
    let client = DeliveryClient::new(&config.delivery)?;
    Ok(Reconciler::new(
        config.enabled_metrics(),
        SampleStore::new(bus),
        Backlog::from_config(&config.backlog),
        client,
    ))
}

/// A running relay
pub struct Relay {
    reconciler: Arc<Reconciler<DeliveryClient>>,
    subscription: Option<SubscriptionHandle>,
    ingest: JoinHandle<()>,
    scheduler: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl Relay {
    /// Start with the schedule from `config`
    pub async fn start(config: &Config, bus: Arc<dyn DataBus>) -> anyhow::Result<Self> {
        Self::start_with(config, bus, Scheduler::new(&config.schedule)).await
    }

    /// Start with an explicit scheduler
    ///
    /// A bus that refuses the subscription is logged and tolerated: ticks
    /// still run and read through the direct-query fallback.
    pub async fn start_with(
        config: &Config,
        bus: Arc<dyn DataBus>,
        scheduler: Scheduler,
    ) -> anyhow::Result<Self> {
        let reconciler = Arc::new(build_reconciler(config, bus.clone())?);
        let metrics = reconciler.enabled_metrics().to_vec();

        tracing::info!(
            endpoint = %reconciler.client().display_endpoint(),
            metrics = ?metrics.iter().map(|m| m.id()).collect::<Vec<_>>(),
            backlog = %reconciler.backlog().path().display(),
            "Starting relay"
        );

        let (delta_tx, delta_rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let ingest = crate::ingest::spawn(reconciler.store().clone(), delta_rx);

        let period = Duration::from_millis(config.bus.subscription_period_ms);
        let subscriptions = metrics
            .iter()
            .map(|m| Subscription {
                path: m.path().to_string(),
                period,
            })
            .collect();

        let subscription = match bus.subscribe(subscriptions, delta_tx).await {
            Ok(handle) => {
                tracing::info!(paths = metrics.len(), "Subscribed to bus");
                Some(handle)
            }
            Err(e) => {
                tracing::error!(error = %e, "Bus subscription failed, relying on direct queries");
                None
            }
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let ticking = reconciler.clone();
        let scheduler = scheduler.spawn(
            move || {
                let reconciler = ticking.clone();
                async move {
                    reconciler.tick().await;
                }
            },
            shutdown_rx,
        );

        Ok(Self {
            reconciler,
            subscription,
            ingest,
            scheduler,
            shutdown_tx,
        })
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<DeliveryClient>> {
        &self.reconciler
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .as_ref()
            .map(SubscriptionHandle::is_active)
            .unwrap_or(false)
    }

    /// Release bus subscriptions, halt the scheduler and the ingest task
    ///
    /// Ticks already in flight finish on their own.
    pub async fn stop(self) {
        if let Some(subscription) = self.subscription {
            subscription.unsubscribe();
        }

        let _ = self.shutdown_tx.send(ShutdownSignal::Graceful);
        if let Err(e) = self.scheduler.await {
            tracing::warn!(error = %e, "Scheduler task ended abnormally");
        }

        self.ingest.abort();
        tracing::info!("Relay stopped");
    }
}
