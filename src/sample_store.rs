use dashmap::DashMap;
use std::sync::Arc;

use crate::bus::DataBus;
use crate::record::{Metric, Observation};

/// Where a stored observation came from
#[derive(Debug, Clone)]
struct Sample {
    observation: Observation,
    /// `false` for values fetched by a direct query
    pushed: bool,
}

/// Latest observation per metric
///
/// Written by the ingest task as deltas arrive; read on every tick. Until a
/// push has arrived for a metric, each read queries the bus directly and
/// only falls back to the last fetched value when the query finds nothing.
#[derive(Clone)]
pub struct SampleStore {
    samples: Arc<DashMap<Metric, Sample>>,
    bus: Arc<dyn DataBus>,
}

impl SampleStore {
    pub fn new(bus: Arc<dyn DataBus>) -> Self {
        Self {
            samples: Arc::new(DashMap::new()),
            bus,
        }
    }

    /// Overwrite the observation for `metric` with a pushed value
    pub fn update(&self, metric: Metric, value: serde_json::Value, unit: Option<String>) {
        self.samples.insert(
            metric,
            Sample {
                observation: Observation::new(value, unit),
                pushed: true,
            },
        );
    }

    /// Latest observation, querying the bus while nothing was pushed yet
    pub async fn read(&self, metric: Metric) -> Option<Observation> {
        let fetched_before = match self.samples.get(&metric) {
            Some(sample) if sample.pushed => return Some(sample.observation.clone()),
            Some(sample) => Some(sample.observation.clone()),
            None => None,
        };

        let Some(found) = self.bus.get_value(metric.path()).await else {
            return fetched_before;
        };
        let unit = found
            .units()
            .map(str::to_string)
            .or_else(|| metric.unit().map(str::to_string));

        tracing::debug!(metric = %metric, "No pushed value yet, using direct bus query");

        let fetched = Sample {
            observation: Observation::new(found.value, unit),
            pushed: false,
        };
        let mut entry = self.samples.entry(metric).or_insert_with(|| fetched.clone());
        // A push may have landed while the query was in flight; it is newer
        if !entry.pushed {
            *entry = fetched;
        }
        Some(entry.observation.clone())
    }

    /// Stored observation (pushed or fetched), without touching the bus
    pub fn cached(&self, metric: Metric) -> Option<Observation> {
        self.samples.get(&metric).map(|s| s.observation.clone())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
