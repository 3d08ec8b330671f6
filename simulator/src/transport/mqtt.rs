//! Azure IoT Hub device link over MQTT (rumqttc).

use super::{Connector, Link, Message};
use crate::config::Device;
use crate::credential::url_encode;
use crate::errors::{ConnectionError, DeliveryError};
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS, Transport,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const IOTHUB_MQTT_PORT: u16 = 8883;

/// Builds one TLS MQTT connection per device from its connection string.
#[derive(Debug, Clone)]
pub struct IotHubConnector {
    /// Lifetime of the SAS token minted at connect time.
    pub sas_ttl: Duration,
    pub keep_alive: Duration,
}

impl Default for IotHubConnector {
    fn default() -> Self {
        Self {
            sas_ttl: Duration::from_secs(24 * 60 * 60),
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// What the event loop task reports back to the link.
#[derive(Debug)]
enum LinkSignal {
    Connected,
    Refused(String),
    /// A PUBLISH with this packet id went out on the wire.
    Published(u16),
    Acked(u16),
    Failed(String),
}

/// Pairs outgoing packet ids with the publishes this link issued, in
/// order. A packet id already waiting for its PUBACK is a retransmission
/// after reconnect and does not start a new publish.
#[derive(Debug, Default)]
struct InFlight {
    issued: u64,
    observed: u64,
    unacked: HashMap<u16, u64>,
}

impl InFlight {
    /// Sequence number of the publish just handed to the client.
    fn issue(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    /// Returns the sequence number a PUBACK settles, if any.
    fn observe(&mut self, signal: &LinkSignal) -> Option<u64> {
        match signal {
            LinkSignal::Published(pkid) => {
                if !self.unacked.contains_key(pkid) {
                    self.observed += 1;
                    self.unacked.insert(*pkid, self.observed);
                }
                None
            }
            LinkSignal::Acked(pkid) => self.unacked.remove(pkid),
            _ => None,
        }
    }
}

/// Aborts the polling task when the link goes away on any path.
struct PollerGuard(JoinHandle<()>);

impl Drop for PollerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct MqttLink {
    device_id: String,
    client: AsyncClient,
    signals: mpsc::UnboundedReceiver<LinkSignal>,
    poller: Option<PollerGuard>,
    in_flight: InFlight,
    topic: String,
}

#[async_trait]
impl Connector for IotHubConnector {
    type Link = MqttLink;

    async fn connect(&self, device: &Device) -> Result<MqttLink, ConnectionError> {
        let credential = &device.credential;
        let password = credential
            .password(Utc::now(), self.sas_ttl)
            .map_err(ConnectionError::Credential)?;

        info!(
            "[{}] Connecting to {} as {}",
            device.id, credential.host_name, credential.device_id
        );

        let mut mqtt_options = MqttOptions::new(
            credential.device_id.clone(),
            credential.host_name.clone(),
            IOTHUB_MQTT_PORT,
        );
        mqtt_options.set_keep_alive(self.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options.set_credentials(credential.username(), password);
        mqtt_options.set_transport(Transport::tls_with_default_config());

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);
        let (tx, mut signals) = mpsc::unbounded_channel();

        let device_id = device.id.clone();
        let poller = PollerGuard(tokio::spawn(async move {
            loop {
                let signal = match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            LinkSignal::Connected
                        } else {
                            LinkSignal::Refused(format!("{:?}", ack.code))
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => LinkSignal::Published(pkid),
                    Ok(Event::Incoming(Packet::PubAck(ack))) => LinkSignal::Acked(ack.pkid),
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("[{}] MQTT disconnect sent", device_id);
                        break;
                    }
                    Ok(_) => continue,
                    Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                        LinkSignal::Refused(format!("{:?}", code))
                    }
                    Err(e) => {
                        error!("[{}] MQTT eventloop error: {}", device_id, e);
                        let _ = tx.send(LinkSignal::Failed(e.to_string()));
                        // rumqttc reconnects on the next poll
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                if tx.send(signal).is_err() {
                    break;
                }
            }
        }));

        // The session bounds this wait with its open timeout
        loop {
            match signals.recv().await {
                Some(LinkSignal::Connected) => break,
                Some(LinkSignal::Refused(reason)) => return Err(ConnectionError::Refused(reason)),
                Some(LinkSignal::Failed(reason)) => return Err(ConnectionError::Transport(reason)),
                Some(LinkSignal::Published(_) | LinkSignal::Acked(_)) => continue,
                None => {
                    return Err(ConnectionError::Transport(
                        "event loop stopped before CONNACK".to_string(),
                    ))
                }
            }
        }

        Ok(MqttLink {
            topic: telemetry_topic(&credential.device_id),
            device_id: device.id.clone(),
            client,
            signals,
            poller: Some(poller),
            in_flight: InFlight::default(),
        })
    }

    fn name(&self) -> &'static str {
        "iothub-mqtt"
    }
}

/// Device-to-cloud topic with the content metadata as a property bag.
fn telemetry_topic(device_id: &str) -> String {
    format!(
        "devices/{}/messages/events/$.ct={}&$.ce={}",
        device_id,
        url_encode(super::CONTENT_TYPE),
        url_encode(super::CONTENT_ENCODING)
    )
}

#[async_trait]
impl Link for MqttLink {
    async fn send(&mut self, message: &Message) -> Result<(), DeliveryError> {
        // Earlier publishes may still be settling; only their bookkeeping matters
        while let Ok(signal) = self.signals.try_recv() {
            self.in_flight.observe(&signal);
        }

        let topic = format!(
            "{}&$.mid={}",
            self.topic,
            url_encode(&message.message_id.to_string())
        );
        self.client
            .publish(topic, QoS::AtLeastOnce, false, message.payload.clone())
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        let seq = self.in_flight.issue();

        loop {
            let Some(signal) = self.signals.recv().await else {
                return Err(DeliveryError::Transport("event loop stopped".to_string()));
            };
            if let Some(settled) = self.in_flight.observe(&signal) {
                if settled == seq {
                    return Ok(());
                }
                debug!("[{}] late PUBACK for publish #{}", self.device_id, settled);
                continue;
            }
            match signal {
                LinkSignal::Failed(reason) => return Err(DeliveryError::Transport(reason)),
                LinkSignal::Refused(reason) => {
                    return Err(DeliveryError::Transport(format!("reconnect refused: {}", reason)))
                }
                _ => continue,
            }
        }
    }

    async fn disconnect(&mut self) {
        let Some(poller) = self.poller.take() else {
            return;
        };
        if let Err(e) = self.client.disconnect().await {
            warn!("[{}] MQTT disconnect failed: {}", self.device_id, e);
        }
        // Give the event loop a moment to flush DISCONNECT, then drop the guard
        let mut handle = poller;
        if tokio::time::timeout(Duration::from_secs(2), &mut handle.0)
            .await
            .is_err()
        {
            debug!("[{}] event loop did not stop in time, aborting", self.device_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_topic_carries_content_metadata() {
        assert_eq!(
            telemetry_topic("device_A"),
            "devices/device_A/messages/events/$.ct=application%2Fjson&$.ce=utf-8"
        );
    }

    #[test]
    fn test_late_puback_does_not_confirm_next_publish() {
        let mut in_flight = InFlight::default();

        // Publish #1 goes out and its deliver timeout expires unacknowledged
        let first = in_flight.issue();
        assert_eq!(in_flight.observe(&LinkSignal::Published(7)), None);

        // Publish #2 is issued before #1's PUBACK arrives
        let second = in_flight.issue();
        assert_eq!(in_flight.observe(&LinkSignal::Acked(7)), Some(first));
        assert_eq!(in_flight.observe(&LinkSignal::Published(8)), None);
        assert_eq!(in_flight.observe(&LinkSignal::Acked(8)), Some(second));
    }

    #[test]
    fn test_outgoing_seen_after_next_publish_issued() {
        let mut in_flight = InFlight::default();

        // #1 was still queued in the client when #2 was issued
        let first = in_flight.issue();
        let second = in_flight.issue();
        in_flight.observe(&LinkSignal::Published(1));
        in_flight.observe(&LinkSignal::Published(2));

        assert_eq!(in_flight.observe(&LinkSignal::Acked(2)), Some(second));
        assert_eq!(in_flight.observe(&LinkSignal::Acked(1)), Some(first));
    }

    #[test]
    fn test_retransmission_keeps_first_sequence() {
        let mut in_flight = InFlight::default();
        let first = in_flight.issue();
        in_flight.observe(&LinkSignal::Published(3));

        // Reconnect resends pkid 3 before the next publish goes out
        in_flight.observe(&LinkSignal::Published(3));
        let second = in_flight.issue();
        in_flight.observe(&LinkSignal::Published(4));

        assert_eq!(in_flight.observe(&LinkSignal::Acked(3)), Some(first));
        assert_eq!(in_flight.observe(&LinkSignal::Acked(4)), Some(second));
        assert_eq!(in_flight.observe(&LinkSignal::Acked(4)), None);
    }
}
