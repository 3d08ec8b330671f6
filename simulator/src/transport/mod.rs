//! Connector/link abstraction over the ingestion endpoint.

pub mod memory;
pub mod mqtt;

use crate::config::Device;
use crate::errors::{ConnectionError, DeliveryError};
use crate::model::TelemetryReading;
use async_trait::async_trait;
use uuid::Uuid;

pub const CONTENT_TYPE: &str = "application/json";
pub const CONTENT_ENCODING: &str = "utf-8";

/// One serialized reading plus the metadata the endpoint routes on.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: Uuid,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn from_reading(reading: &TelemetryReading) -> Result<Self, DeliveryError> {
        Ok(Self {
            message_id: Uuid::new_v4(),
            content_type: CONTENT_TYPE,
            content_encoding: CONTENT_ENCODING,
            payload: serde_json::to_vec(reading)?,
        })
    }

    /// Payload as text for logging; always valid since it is JSON.
    pub fn body(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or_default()
    }
}

/// An established connection owned by exactly one device session.
#[async_trait]
pub trait Link: Send + 'static {
    /// Send one message and wait for the endpoint to accept it.
    async fn send(&mut self, message: &Message) -> Result<(), DeliveryError>;

    /// Release the connection. Must tolerate being called on a dead link.
    async fn disconnect(&mut self);
}

/// Factory for per-device links.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Link: Link;

    async fn connect(&self, device: &Device) -> Result<Self::Link, ConnectionError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
