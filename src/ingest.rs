use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::Delta;
use crate::record::Metric;
use crate::sample_store::SampleStore;

/// Apply every value in `delta` to the store; returns how many were tracked metrics
///
/// Pushed values carry no unit, so each metric's canonical unit is stamped on.
pub fn apply_delta(store: &SampleStore, delta: &Delta) -> usize {
    let mut applied = 0;
    for update in &delta.updates {
        for pv in &update.values {
            match Metric::from_path(&pv.path) {
                Some(metric) => {
                    tracing::debug!(metric = %metric, value = %pv.value, "Bus update");
                    store.update(metric, pv.value.clone(), metric.unit().map(str::to_string));
                    applied += 1;
                }
                None => tracing::debug!(path = %pv.path, "Ignoring untracked bus path"),
            }
        }
    }
    applied
}

/// Background task draining bus deltas into the store until the channel closes
pub fn spawn(store: SampleStore, mut rx: mpsc::Receiver<Delta>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delta) = rx.recv().await {
            apply_delta(&store, &delta);
        }
        tracing::debug!("Bus delta channel closed, ingest task exiting");
    })
}
