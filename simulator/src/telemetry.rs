use crate::config::Device;
use crate::model::{
    TelemetryReading, EXTERNAL_TEMPERATURE_C, ICE_THICKNESS_CM, SNOW_ACCUMULATION_CM,
    SURFACE_TEMPERATURE_C,
};
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use rand::Rng;
use tokio::time::Instant;

/// Reading for `device` stamped with the current wall clock.
pub fn generate(device: &Device) -> TelemetryReading {
    generate_with(&mut rand::thread_rng(), device, Utc::now())
}

/// Each field is an independent uniform draw over its closed range,
/// rounded to two decimals after sampling.
pub fn generate_with<R: Rng + ?Sized>(
    rng: &mut R,
    device: &Device,
    now: DateTime<Utc>,
) -> TelemetryReading {
    TelemetryReading {
        device_id: device.id.clone(),
        location: device.location.clone(),
        timestamp: now.trunc_subsecs(0),
        ice_thickness_cm: round2(rng.gen_range(ICE_THICKNESS_CM)),
        surface_temperature_c: round2(rng.gen_range(SURFACE_TEMPERATURE_C)),
        snow_accumulation_cm: round2(rng.gen_range(SNOW_ACCUMULATION_CM)),
        external_temperature_c: round2(rng.gen_range(EXTERNAL_TEMPERATURE_C)),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Wall-clock time that advances with the tokio clock.
///
/// Anchored once at fleet start so every device stamps readings against
/// the same origin, and paused test time produces distinct timestamps.
#[derive(Debug, Clone, Copy)]
pub struct CadenceClock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl CadenceClock {
    pub fn start() -> Self {
        Self::anchored(Utc::now())
    }

    pub fn anchored(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            origin: Instant::now(),
        }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.origin.elapsed()).unwrap_or(TimeDelta::zero());
        self.wall + elapsed
    }
}
