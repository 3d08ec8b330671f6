//! In-process ingestion endpoint for dry runs and tests.

use super::{Connector, Link, Message, CONTENT_ENCODING, CONTENT_TYPE};
use crate::config::Device;
use crate::errors::{ConnectionError, DeliveryError};
use crate::model::TelemetryReading;
use crate::validate::validate;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Injected misbehavior for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    RefuseConnect,
    FailDelivery,
    /// `send` never completes; only the caller's timeout ends it.
    StallDelivery,
}

/// A message the endpoint accepted, decoded back into a reading.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub device_id: String,
    pub message_id: Uuid,
    pub content_type: String,
    pub content_encoding: String,
    pub reading: TelemetryReading,
}

#[derive(Debug, Default)]
struct EndpointState {
    faults: HashMap<String, Fault>,
    received: Vec<ReceivedMessage>,
    connects: HashMap<String, u32>,
    disconnects: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEndpoint {
    state: Arc<Mutex<EndpointState>>,
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(self, device_id: &str, fault: Fault) -> Self {
        self.lock().faults.insert(device_id.to_string(), fault);
        self
    }

    pub fn received(&self) -> Vec<ReceivedMessage> {
        self.lock().received.clone()
    }

    pub fn received_for(&self, device_id: &str) -> Vec<ReceivedMessage> {
        self.lock()
            .received
            .iter()
            .filter(|m| m.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn connect_count(&self, device_id: &str) -> u32 {
        self.lock().connects.get(device_id).copied().unwrap_or(0)
    }

    pub fn disconnect_count(&self, device_id: &str) -> u32 {
        self.lock().disconnects.get(device_id).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        // A panicking test thread must not hide what was recorded
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fault(&self, device_id: &str) -> Option<Fault> {
        self.lock().faults.get(device_id).copied()
    }
}

#[async_trait]
impl Connector for MemoryEndpoint {
    type Link = MemoryLink;

    async fn connect(&self, device: &Device) -> Result<MemoryLink, ConnectionError> {
        if self.fault(&device.id) == Some(Fault::RefuseConnect) {
            return Err(ConnectionError::Refused(format!(
                "{} is not registered",
                device.id
            )));
        }

        *self.lock().connects.entry(device.id.clone()).or_default() += 1;
        debug!("[{}] connected to in-memory endpoint", device.id);

        Ok(MemoryLink {
            device_id: device.id.clone(),
            endpoint: self.clone(),
            open: true,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Debug)]
pub struct MemoryLink {
    device_id: String,
    endpoint: MemoryEndpoint,
    open: bool,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&mut self, message: &Message) -> Result<(), DeliveryError> {
        if !self.open {
            return Err(DeliveryError::Transport("link is closed".to_string()));
        }
        match self.endpoint.fault(&self.device_id) {
            Some(Fault::FailDelivery) => {
                return Err(DeliveryError::Transport("connection reset by peer".to_string()))
            }
            Some(Fault::StallDelivery) => std::future::pending::<()>().await,
            _ => {}
        }

        if message.content_type != CONTENT_TYPE || message.content_encoding != CONTENT_ENCODING {
            return Err(DeliveryError::Rejected(format!(
                "unsupported content {}/{}",
                message.content_type, message.content_encoding
            )));
        }
        let reading = serde_json::from_slice::<TelemetryReading>(&message.payload)
            .map_err(|e| DeliveryError::Rejected(format!("JSON parse error: {}", e)))?;
        validate(&reading)?;

        self.endpoint.lock().received.push(ReceivedMessage {
            device_id: self.device_id.clone(),
            message_id: message.message_id,
            content_type: message.content_type.to_string(),
            content_encoding: message.content_encoding.to_string(),
            reading,
        });
        Ok(())
    }

    async fn disconnect(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        *self
            .endpoint
            .lock()
            .disconnects
            .entry(self.device_id.clone())
            .or_default() += 1;
        debug!("[{}] disconnected from in-memory endpoint", self.device_id);
    }
}
