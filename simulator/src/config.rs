use crate::credential::ConnectionString;
use crate::errors::ConfigError;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

/// The canal sensors deployed by default, with their partition labels.
pub const DEFAULT_DEVICES: [(&str, &str); 3] = [
    ("device_A", "Dow's Lake"),
    ("device_B", "Fifth Avenue"),
    ("device_C", "NAC"),
];

/// A fixed-location sensor. Immutable for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub location: String,
    pub credential: ConnectionString,
}

/// `ID=LOCATION` as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub id: String,
    pub location: String,
}

impl DeviceSpec {
    pub fn new(id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: location.into(),
        }
    }

    /// Environment variable holding this device's connection string.
    pub fn credential_var(&self) -> String {
        let suffix: String = self
            .id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("IOTHUB_{}", suffix)
    }

    pub fn defaults() -> Vec<DeviceSpec> {
        DEFAULT_DEVICES
            .iter()
            .map(|(id, location)| DeviceSpec::new(*id, *location))
            .collect()
    }
}

impl FromStr for DeviceSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, location) = s
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidDeviceSpec(s.to_string()))?;
        let spec = DeviceSpec::new(id.trim(), location.trim());
        if spec.id.is_empty() || spec.location.is_empty() {
            return Err(ConfigError::InvalidDeviceSpec(s.to_string()));
        }
        Ok(spec)
    }
}

/// Bounded retry within a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first; 0 leaves recovery to the next tick.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based): doubles up to `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FleetOptions {
    /// Cadence shared by every device.
    pub interval: Duration,
    pub open_timeout: Duration,
    pub deliver_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            open_timeout: Duration::from_secs(30),
            deliver_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl FleetOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroDuration("interval"));
        }
        if self.open_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("open timeout"));
        }
        if self.deliver_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("deliver timeout"));
        }
        Ok(())
    }
}

/// Everything the fleet needs, resolved before startup.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub devices: Vec<Device>,
    pub options: FleetOptions,
}

impl FleetConfig {
    /// Resolves credentials through `lookup`. Fails on the first device
    /// whose connection string is absent or malformed.
    pub fn from_lookup<F>(
        specs: &[DeviceSpec],
        options: FleetOptions,
        lookup: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut devices = Vec::with_capacity(specs.len());
        for spec in specs {
            let env_var = spec.credential_var();
            let raw = lookup(&env_var)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingCredential {
                    device_id: spec.id.clone(),
                    env_var: env_var.clone(),
                })?;
            let credential = raw
                .parse::<ConnectionString>()
                .map_err(|reason| ConfigError::InvalidCredential {
                    device_id: spec.id.clone(),
                    reason,
                })?;
            devices.push(Device {
                id: spec.id.clone(),
                location: spec.location.clone(),
                credential,
            });
        }

        let config = Self { devices, options };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env(specs: &[DeviceSpec], options: FleetOptions) -> Result<Self, ConfigError> {
        Self::from_lookup(specs, options, |key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() || device.location.is_empty() {
                return Err(ConfigError::IncompleteDevice(device.id.clone()));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.id.clone()));
            }
        }

        self.options.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env() -> HashMap<String, String> {
        DeviceSpec::defaults()
            .iter()
            .map(|spec| {
                (
                    spec.credential_var(),
                    format!(
                        "HostName=hub.azure-devices.net;DeviceId={};SharedAccessKey=c2VjcmV0",
                        spec.id
                    ),
                )
            })
            .collect()
    }

    #[test]
    fn test_credential_var_names() {
        assert_eq!(DeviceSpec::new("device_A", "x").credential_var(), "IOTHUB_DEVICE_A");
        assert_eq!(DeviceSpec::new("sensor-7", "x").credential_var(), "IOTHUB_SENSOR_7");
    }

    #[test]
    fn test_load_default_fleet() {
        let vars = env();
        let config = FleetConfig::from_lookup(&DeviceSpec::defaults(), FleetOptions::default(), |k| {
            vars.get(k).cloned()
        })
        .unwrap();

        let ids: Vec<_> = config.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["device_A", "device_B", "device_C"]);
        assert_eq!(config.devices[1].location, "Fifth Avenue");
        assert_eq!(config.devices[2].credential.device_id, "device_C");
    }

    #[test]
    fn test_missing_credential_is_fatal() {
        let mut vars = env();
        vars.remove("IOTHUB_DEVICE_B");
        let err = FleetConfig::from_lookup(&DeviceSpec::defaults(), FleetOptions::default(), |k| {
            vars.get(k).cloned()
        })
        .unwrap_err();

        match err {
            ConfigError::MissingCredential { device_id, env_var } => {
                assert_eq!(device_id, "device_B");
                assert_eq!(env_var, "IOTHUB_DEVICE_B");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_blank_and_malformed_credentials() {
        let mut vars = env();
        vars.insert("IOTHUB_DEVICE_A".to_string(), "   ".to_string());
        assert!(matches!(
            FleetConfig::from_lookup(&DeviceSpec::defaults(), FleetOptions::default(), |k| vars
                .get(k)
                .cloned()),
            Err(ConfigError::MissingCredential { .. })
        ));

        vars.insert("IOTHUB_DEVICE_A".to_string(), "HostName=only".to_string());
        assert!(matches!(
            FleetConfig::from_lookup(&DeviceSpec::defaults(), FleetOptions::default(), |k| vars
                .get(k)
                .cloned()),
            Err(ConfigError::InvalidCredential { .. })
        ));
    }

    #[test]
    fn test_duplicate_and_empty_fleets() {
        let vars = env();
        let specs = vec![
            DeviceSpec::new("device_A", "Dow's Lake"),
            DeviceSpec::new("device_A", "NAC"),
        ];
        assert!(matches!(
            FleetConfig::from_lookup(&specs, FleetOptions::default(), |k| vars.get(k).cloned()),
            Err(ConfigError::DuplicateDevice(_))
        ));
        assert!(matches!(
            FleetConfig::from_lookup(&[], FleetOptions::default(), |k| vars.get(k).cloned()),
            Err(ConfigError::NoDevices)
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let options = FleetOptions {
            interval: Duration::ZERO,
            ..FleetOptions::default()
        };
        assert!(matches!(options.validate(), Err(ConfigError::ZeroDuration(_))));
    }

    #[test]
    fn test_device_spec_parse() {
        let spec: DeviceSpec = "device_D = Hartwell Locks".parse().unwrap();
        assert_eq!(spec, DeviceSpec::new("device_D", "Hartwell Locks"));
        assert!("device_D".parse::<DeviceSpec>().is_err());
        assert!("=NAC".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_millis(500));
    }
}
