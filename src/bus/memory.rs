use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{BusMeta, BusValue, DataBus, Delta, PathValue, Subscription, SubscriptionHandle};
use crate::error::BusError;

struct Subscriber {
    paths: HashSet<String>,
    sink: mpsc::Sender<Delta>,
    active: Arc<AtomicBool>,
}

/// In-process bus for embedding the relay in a host that already owns the data
///
/// `publish` stores the value and pushes it to every active subscriber of
/// that path; `set_value` only makes it visible to direct queries.
#[derive(Default)]
pub struct MemoryBus {
    values: DashMap<String, BusValue>,
    subscribers: Mutex<Vec<Subscriber>>,
    reject_subscriptions: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `value` visible to `get_value` without notifying subscribers
    pub fn set_value(&self, path: &str, value: serde_json::Value, units: Option<&str>) {
        self.values.insert(
            path.to_string(),
            BusValue {
                value,
                meta: Some(BusMeta {
                    units: units.map(str::to_string),
                }),
            },
        );
    }

    /// Store `value` and push it to subscribers of `path`
    pub async fn publish(&self, path: &str, value: serde_json::Value) {
        let units = self
            .values
            .get(path)
            .and_then(|v| v.units().map(str::to_string));
        self.set_value(path, value.clone(), units.as_deref());

        let sinks: Vec<mpsc::Sender<Delta>> = {
            let mut subscribers = match self.subscribers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            subscribers.retain(|s| s.active.load(Ordering::Acquire) && !s.sink.is_closed());
            subscribers
                .iter()
                .filter(|s| s.paths.contains(path))
                .map(|s| s.sink.clone())
                .collect()
        };

        for sink in sinks {
            let delta = Delta::from_values(vec![PathValue {
                path: path.to_string(),
                value: value.clone(),
            }]);
            if sink.send(delta).await.is_err() {
                tracing::debug!(path = %path, "Subscriber went away during publish");
            }
        }
    }

    /// Make subsequent `subscribe` calls fail
    pub fn reject_subscriptions(&self, reject: bool) {
        self.reject_subscriptions.store(reject, Ordering::Release);
    }

    /// Number of subscription batches still registered and active
    pub fn active_subscriptions(&self) -> usize {
        match self.subscribers.lock() {
            Ok(guard) => guard
                .iter()
                .filter(|s| s.active.load(Ordering::Acquire))
                .count(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .filter(|s| s.active.load(Ordering::Acquire))
                .count(),
        }
    }
}

#[async_trait]
impl DataBus for MemoryBus {
    async fn subscribe(
        &self,
        subscriptions: Vec<Subscription>,
        sink: mpsc::Sender<Delta>,
    ) -> Result<SubscriptionHandle, BusError> {
        if self.reject_subscriptions.load(Ordering::Acquire) {
            return Err(BusError::Subscribe {
                message: "bus is not accepting subscriptions".to_string(),
            });
        }

        let active = Arc::new(AtomicBool::new(true));
        let subscriber = Subscriber {
            paths: subscriptions.into_iter().map(|s| s.path).collect(),
            sink,
            active: active.clone(),
        };

        match self.subscribers.lock() {
            Ok(mut guard) => guard.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }

        Ok(SubscriptionHandle::new(active, Vec::new()))
    }

    async fn get_value(&self, path: &str) -> Option<BusValue> {
        self.values.get(path).map(|v| v.value().clone())
    }
}
