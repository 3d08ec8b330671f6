use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

pub const ICE_THICKNESS_CM: RangeInclusive<f64> = 10.0..=45.0;
pub const SURFACE_TEMPERATURE_C: RangeInclusive<f64> = -20.0..=5.0;
pub const SNOW_ACCUMULATION_CM: RangeInclusive<f64> = 0.0..=50.0;
pub const EXTERNAL_TEMPERATURE_C: RangeInclusive<f64> = -25.0..=5.0;

/// One ice-conditions sample from a canal sensor.
///
/// Field names are the JSON schema the ingestion endpoint consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub device_id: String,
    pub location: String,
    #[serde(with = "utc_seconds")]
    pub timestamp: DateTime<Utc>,
    pub ice_thickness_cm: f64,
    pub surface_temperature_c: f64,
    pub snow_accumulation_cm: f64,
    pub external_temperature_c: f64,
}

/// `YYYY-MM-DDTHH:MM:SSZ`, always UTC, no fractional seconds.
pub mod utc_seconds {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&ts.format(FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_json_field_names() {
        let reading = TelemetryReading {
            device_id: "device_A".to_string(),
            location: "Dow's Lake".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 2, 1, 8, 30, 5).unwrap(),
            ice_thickness_cm: 27.5,
            surface_temperature_c: -3.25,
            snow_accumulation_cm: 12.0,
            external_temperature_c: -10.75,
        };

        let value = serde_json::to_value(&reading).unwrap();
        assert_eq!(value["device_id"], "device_A");
        assert_eq!(value["location"], "Dow's Lake");
        assert_eq!(value["timestamp"], "2025-02-01T08:30:05Z");
        assert_eq!(value["ice_thickness_cm"], 27.5);
        assert_eq!(value["surface_temperature_c"], -3.25);
        assert_eq!(value["snow_accumulation_cm"], 12.0);
        assert_eq!(value["external_temperature_c"], -10.75);

        let back: TelemetryReading = serde_json::from_value(value).unwrap();
        assert_eq!(back, reading);
    }

    #[test]
    fn test_timestamp_rejects_garbage() {
        let json = r#"{"device_id":"d","location":"l","timestamp":"yesterday",
            "ice_thickness_cm":20.0,"surface_temperature_c":0.0,
            "snow_accumulation_cm":1.0,"external_temperature_c":0.0}"#;
        assert!(serde_json::from_str::<TelemetryReading>(json).is_err());
    }
}
