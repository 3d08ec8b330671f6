use crate::config::Device;
use crate::errors::{ConnectionError, DeliveryError};
use crate::model::TelemetryReading;
use crate::transport::{Connector, Link, Message};
use std::fmt;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Health of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Connected,
    /// Last delivery failed; cleared by the next successful one.
    Degraded,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "uninitialized"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Degraded => write!(f, "degraded"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Owns one device's link exclusively and delivers one reading at a time.
///
/// No reconnect happens here. Dropping the session drops the link, which
/// releases the underlying connection even if `close` was never reached.
pub struct DeviceSession<L: Link> {
    device: Device,
    link: Option<L>,
    state: SessionState,
    attempts: u64,
    deliver_timeout: Duration,
}

impl<L: Link> DeviceSession<L> {
    pub fn new(device: Device, deliver_timeout: Duration) -> Self {
        Self {
            device,
            link: None,
            state: SessionState::Uninitialized,
            attempts: 0,
            deliver_timeout,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of `deliver` calls made over the session's lifetime.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub async fn open<C>(&mut self, connector: &C, open_timeout: Duration) -> Result<(), ConnectionError>
    where
        C: Connector<Link = L>,
    {
        if self.state != SessionState::Uninitialized {
            return Err(ConnectionError::InvalidState(self.state));
        }

        let link = timeout(open_timeout, connector.connect(&self.device))
            .await
            .map_err(|_| ConnectionError::Timeout(open_timeout))??;

        info!("[{}] Connected via {}", self.device.id, connector.name());
        self.link = Some(link);
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Serializes `reading` and sends it over the open link.
    ///
    /// Any failure leaves the session `Degraded`; a later success restores
    /// `Connected`.
    pub async fn deliver(&mut self, reading: &TelemetryReading) -> Result<Message, DeliveryError> {
        let link = match (self.state, self.link.as_mut()) {
            (SessionState::Connected | SessionState::Degraded, Some(link)) => link,
            (state, _) => return Err(DeliveryError::NotConnected(state)),
        };
        self.attempts += 1;

        let result = match Message::from_reading(reading) {
            Ok(message) => match timeout(self.deliver_timeout, link.send(&message)).await {
                Ok(Ok(())) => Ok(message),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(DeliveryError::Timeout(self.deliver_timeout)),
            },
            Err(e) => Err(e),
        };

        self.state = match result {
            Ok(_) => SessionState::Connected,
            Err(_) => SessionState::Degraded,
        };
        result
    }

    /// Releases the link. Safe to call in any state, any number of times.
    pub async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.disconnect().await;
            debug!("[{}] Session closed", self.device.id);
        }
        self.state = SessionState::Closed;
    }
}
