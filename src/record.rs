//! Metric identifiers, observations and the record delivered on each tick.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Wire format of the `datetime` field (local time)
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A tracked sensor quantity.
///
/// The set is fixed; each metric maps to exactly one bus path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    BatteryVoltage,
    BatteryCurrent,
    StateOfCharge,
    SolarPower,
    InsideTemperature,
    OutsideTemperature,
    FreshWaterLevel,
    Position,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::BatteryVoltage,
        Metric::BatteryCurrent,
        Metric::StateOfCharge,
        Metric::SolarPower,
        Metric::InsideTemperature,
        Metric::OutsideTemperature,
        Metric::FreshWaterLevel,
        Metric::Position,
    ];

    /// Identifier used in configuration and as the record key
    pub fn id(&self) -> &'static str {
        match self {
            Metric::BatteryVoltage => "battery_voltage",
            Metric::BatteryCurrent => "battery_current",
            Metric::StateOfCharge => "state_of_charge",
            Metric::SolarPower => "solar_power",
            Metric::InsideTemperature => "inside_temperature",
            Metric::OutsideTemperature => "outside_temperature",
            Metric::FreshWaterLevel => "fresh_water_level",
            Metric::Position => "position",
        }
    }

    /// Bus path this metric is read from
    pub fn path(&self) -> &'static str {
        match self {
            Metric::BatteryVoltage => "electrical.batteries.house.voltage",
            Metric::BatteryCurrent => "electrical.batteries.house.current",
            Metric::StateOfCharge => "electrical.batteries.house.capacity.stateOfCharge",
            Metric::SolarPower => "electrical.solar.main.panelPower",
            Metric::InsideTemperature => "environment.inside.temperature",
            Metric::OutsideTemperature => "environment.outside.temperature",
            Metric::FreshWaterLevel => "tanks.freshWater.0.currentLevel",
            Metric::Position => "navigation.position",
        }
    }

    /// Canonical SI unit of the bus path, `None` for structured values
    pub fn unit(&self) -> Option<&'static str> {
        match self {
            Metric::BatteryVoltage => Some("V"),
            Metric::BatteryCurrent => Some("A"),
            Metric::StateOfCharge | Metric::FreshWaterLevel => Some("ratio"),
            Metric::SolarPower => Some("W"),
            Metric::InsideTemperature | Metric::OutsideTemperature => Some("K"),
            Metric::Position => None,
        }
    }

    pub fn from_id(id: &str) -> Option<Metric> {
        Self::ALL.iter().copied().find(|m| m.id() == id)
    }

    pub fn from_path(path: &str) -> Option<Metric> {
        Self::ALL.iter().copied().find(|m| m.path() == path)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Latest known value of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub value: serde_json::Value,
    pub unit: Option<String>,
}

impl Observation {
    pub fn new(value: serde_json::Value, unit: Option<String>) -> Self {
        Self { value, unit }
    }

    /// Placeholder for an enabled metric that has never been observed
    pub fn absent() -> Self {
        Self {
            value: serde_json::Value::Null,
            unit: None,
        }
    }
}

/// One batch of observations plus timestamp; the unit of delivery.
///
/// Serializes as a flat object: one key per metric id and a `datetime` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub datetime: String,
    #[serde(flatten)]
    pub observations: BTreeMap<String, Observation>,
}

impl Record {
    pub fn new<Tz>(at: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        Self {
            datetime: at.format(DATETIME_FORMAT).to_string(),
            observations: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, metric: Metric, observation: Observation) {
        self.observations.insert(metric.id().to_string(), observation);
    }

    pub fn get(&self, metric: Metric) -> Option<&Observation> {
        self.observations.get(metric.id())
    }

    /// Parse `datetime` back into local time; `None` for foreign formats
    pub fn timestamp(&self) -> Option<DateTime<Local>> {
        let naive = NaiveDateTime::parse_from_str(&self.datetime, DATETIME_FORMAT).ok()?;
        Local.from_local_datetime(&naive).earliest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metric_ids_and_paths_are_unique() {
        let mut ids = std::collections::HashSet::new();
        let mut paths = std::collections::HashSet::new();
        for metric in Metric::ALL {
            assert!(ids.insert(metric.id()), "duplicate id {}", metric.id());
            assert!(paths.insert(metric.path()), "duplicate path {}", metric.path());
        }
    }

    #[test]
    fn test_metric_lookup() {
        assert_eq!(Metric::from_id("solar_power"), Some(Metric::SolarPower));
        assert_eq!(
            Metric::from_path("environment.outside.temperature"),
            Some(Metric::OutsideTemperature)
        );
        assert_eq!(Metric::from_id("wind_speed"), None);
        assert_eq!(Metric::from_path("navigation.speedOverGround"), None);
    }

    #[test]
    fn test_record_wire_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 3).unwrap();
        let mut record = Record::new(&at);
        record.insert(
            Metric::BatteryVoltage,
            Observation::new(json!(12.7), Some("V".to_string())),
        );
        record.insert(Metric::Position, Observation::absent());

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "datetime": "2024-03-09 07:05:03",
                "battery_voltage": {"value": 12.7, "unit": "V"},
                "position": {"value": null, "unit": null}
            })
        );
    }

    #[test]
    fn test_record_parses_persisted_form() {
        let raw = r#"{"datetime":"2024-03-09 07:05:03","solar_power":{"value":140,"unit":"W"}}"#;
        let record: Record = serde_json::from_str(raw).unwrap();
        assert_eq!(record.datetime, "2024-03-09 07:05:03");
        assert_eq!(record.get(Metric::SolarPower).unwrap().value, json!(140));
        assert_eq!(record.observations.len(), 1);
    }

    #[test]
    fn test_record_timestamp() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 3).unwrap();
        assert_eq!(Record::new(&at).timestamp(), Some(at));

        let record = Record {
            datetime: "yesterday".to_string(),
            observations: BTreeMap::new(),
        };
        assert!(record.timestamp().is_none());
    }
}
