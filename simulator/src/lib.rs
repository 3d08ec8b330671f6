//! Ice-safety sensor fleet simulator.
//!
//! Every configured canal sensor gets its own session to the ingestion
//! endpoint and its own cadence driver; a failing device never holds up
//! the others.

pub mod config;
pub mod credential;
pub mod errors;
pub mod fleet;
pub mod metrics;
pub mod model;
pub mod round;
pub mod session;
pub mod shutdown;
pub mod telemetry;
pub mod transport;
pub mod validate;

pub use config::{Device, DeviceSpec, FleetConfig, FleetOptions, RetryPolicy};
pub use errors::{ConfigError, ConnectionError, DeliveryError, Error, Result};
pub use fleet::Fleet;
pub use model::TelemetryReading;
pub use round::{FleetEvent, TickOutcome};
pub use session::{DeviceSession, SessionState};
pub use shutdown::ShutdownCoordinator;
