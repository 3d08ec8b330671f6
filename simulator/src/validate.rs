use crate::errors::DeliveryError;
use crate::model::{
    TelemetryReading, EXTERNAL_TEMPERATURE_C, ICE_THICKNESS_CM, SNOW_ACCUMULATION_CM,
    SURFACE_TEMPERATURE_C,
};
use std::ops::RangeInclusive;

fn check_range(name: &str, value: f64, range: &RangeInclusive<f64>) -> Result<(), DeliveryError> {
    if !range.contains(&value) {
        return Err(DeliveryError::Rejected(format!(
            "{} {} out of range [{}, {}]",
            name,
            value,
            range.start(),
            range.end()
        )));
    }
    Ok(())
}

/// Validates a decoded reading the way the ingestion side would.
pub fn validate(reading: &TelemetryReading) -> Result<(), DeliveryError> {
    check_range("Ice thickness", reading.ice_thickness_cm, &ICE_THICKNESS_CM)?;
    check_range(
        "Surface temperature",
        reading.surface_temperature_c,
        &SURFACE_TEMPERATURE_C,
    )?;
    check_range(
        "Snow accumulation",
        reading.snow_accumulation_cm,
        &SNOW_ACCUMULATION_CM,
    )?;
    check_range(
        "External temperature",
        reading.external_temperature_c,
        &EXTERNAL_TEMPERATURE_C,
    )?;

    if reading.device_id.is_empty() {
        return Err(DeliveryError::Rejected("Device ID cannot be empty".to_string()));
    }
    if reading.location.is_empty() {
        return Err(DeliveryError::Rejected("Location cannot be empty".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading() -> TelemetryReading {
        TelemetryReading {
            device_id: "device_A".to_string(),
            location: "Dow's Lake".to_string(),
            timestamp: Utc::now(),
            ice_thickness_cm: 30.0,
            surface_temperature_c: -5.0,
            snow_accumulation_cm: 10.0,
            external_temperature_c: -12.0,
        }
    }

    #[test]
    fn test_valid_reading() {
        assert!(validate(&reading()).is_ok());
    }

    #[test]
    fn test_range_endpoints_are_valid() {
        let mut r = reading();
        r.ice_thickness_cm = 45.0;
        r.surface_temperature_c = -20.0;
        r.snow_accumulation_cm = 0.0;
        r.external_temperature_c = 5.0;
        assert!(validate(&r).is_ok());
    }

    #[test]
    fn test_thin_ice_rejected() {
        let mut r = reading();
        r.ice_thickness_cm = 9.99;
        assert!(validate(&r).is_err());
    }

    #[test]
    fn test_warm_surface_rejected() {
        let mut r = reading();
        r.surface_temperature_c = 5.01;
        assert!(validate(&r).is_err());
    }

    #[test]
    fn test_negative_snow_rejected() {
        let mut r = reading();
        r.snow_accumulation_cm = -0.5;
        assert!(validate(&r).is_err());
    }

    #[test]
    fn test_nan_rejected() {
        let mut r = reading();
        r.external_temperature_c = f64::NAN;
        assert!(validate(&r).is_err());
    }

    #[test]
    fn test_empty_device_id() {
        let mut r = reading();
        r.device_id = "".to_string();
        assert!(validate(&r).is_err());
    }
}
