//! Host data bus interface
//!
//! The relay consumes two things from the bus: a stream of value deltas for
//! the paths it subscribes to, and a direct lookup used when no delta has
//! arrived yet for a path.

mod http;
mod memory;

pub use http::HttpBus;
pub use memory::MemoryBus;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::BusError;

/// One path the relay wants updates for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub path: String,
    pub period: Duration,
}

/// Update message pushed by the bus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub updates: Vec<Update>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub values: Vec<PathValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    pub path: String,
    pub value: serde_json::Value,
}

impl Delta {
    /// Single-update delta carrying `values`
    pub fn from_values(values: Vec<PathValue>) -> Self {
        Self {
            updates: vec![Update { values }],
        }
    }
}

/// Result of a direct bus lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusValue {
    pub value: serde_json::Value,
    #[serde(default)]
    pub meta: Option<BusMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusMeta {
    #[serde(default)]
    pub units: Option<String>,
}

impl BusValue {
    pub fn units(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.units.as_deref())
    }
}

/// Handle to an active subscription batch
///
/// Dropping the handle does not unsubscribe; call [`SubscriptionHandle::unsubscribe`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    active: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(active: Arc<AtomicBool>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { active, tasks }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivering deltas for this batch
    pub fn unsubscribe(self) {
        self.active.store(false, Ordering::Release);
        for task in self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
pub trait DataBus: Send + Sync {
    /// Register one subscription batch; deltas are pushed into `sink`
    async fn subscribe(
        &self,
        subscriptions: Vec<Subscription>,
        sink: mpsc::Sender<Delta>,
    ) -> Result<SubscriptionHandle, BusError>;

    /// Current value at `path`, `None` if the bus has nothing for it
    async fn get_value(&self, path: &str) -> Option<BusValue>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delta_parses_bus_message() {
        let raw = json!({
            "context": "vessels.self",
            "updates": [{
                "source": {"label": "n2k"},
                "values": [
                    {"path": "electrical.batteries.house.voltage", "value": 13.1},
                    {"path": "navigation.position", "value": {"latitude": 60.1, "longitude": 24.9}}
                ]
            }]
        });

        let delta: Delta = serde_json::from_value(raw).unwrap();
        assert_eq!(delta.updates.len(), 1);
        assert_eq!(delta.updates[0].values.len(), 2);
        assert_eq!(delta.updates[0].values[0].value, json!(13.1));
    }

    #[test]
    fn test_bus_value_units() {
        let with_meta: BusValue =
            serde_json::from_value(json!({"value": 291.2, "meta": {"units": "K"}})).unwrap();
        assert_eq!(with_meta.units(), Some("K"));

        let bare: BusValue = serde_json::from_value(json!({"value": 0.5})).unwrap();
        assert_eq!(bare.units(), None);
    }
}
