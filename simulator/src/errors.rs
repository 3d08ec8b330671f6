use crate::session::SessionState;
use std::time::Duration;
use thiserror::Error;

/// Fatal configuration problems. Startup aborts before any session opens.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing connection string: '{env_var}' not set for device {device_id}")]
    MissingCredential { device_id: String, env_var: String },

    #[error("Invalid connection string for device {device_id}: {reason}")]
    InvalidCredential { device_id: String, reason: String },

    #[error("Invalid device spec '{0}', expected ID=LOCATION")]
    InvalidDeviceSpec(String),

    #[error("Device {0} is listed more than once")]
    DuplicateDevice(String),

    #[error("Device {0} has an empty id or location")]
    IncompleteDevice(String),

    #[error("No devices configured")]
    NoDevices,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// A device's connection could not be established.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("session already {0}")]
    InvalidState(SessionState),
}

/// A single tick's send failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("session is {0}, cannot deliver")]
    NotConnected(SessionState),

    #[error("failed to encode reading: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected by endpoint: {0}")]
    Rejected(String),
}

impl DeliveryError {
    /// Whether another attempt within the same tick could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Timeout(_) => true,
            DeliveryError::Transport(_) => true,

            // Retrying will not fix these
            DeliveryError::NotConnected(_) => false,
            DeliveryError::Encode(_) => false,
            DeliveryError::Rejected(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("No device could be connected ({0} attempted)")]
    NoViableDevices(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
