//! Per-device message channel contract.
//!
//! A [`MessageChannel`] is the bus side of one device: it publishes values
//! under the device prefix and buffers inbound messages until they are
//! drained. Channels are created lazily by a [`ChannelConnector`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Delivery guarantee of a publication or subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = ChannelError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(ChannelError::InvalidQos(other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Options of a single publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to retain the value for late subscribers.
    pub persistent: bool,
    /// Skip the publication when the payload equals the last one sent on
    /// the same topic.
    pub only_if_changed: bool,
    pub qos: Qos,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            only_if_changed: true,
            qos: Qos::AtMostOnce,
        }
    }
}

impl PublishOptions {
    /// Retained, change-suppressed publication (status and identity fields).
    pub fn retained_if_changed(qos: Qos) -> Self {
        Self {
            persistent: true,
            only_if_changed: true,
            qos,
        }
    }

    /// One-shot event: not retained and never suppressed.
    pub fn event(qos: Qos) -> Self {
        Self {
            persistent: false,
            only_if_changed: false,
            qos,
        }
    }
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl ReceivedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload as UTF-8 text, replacing invalid sequences.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// The message-bus side of one device.
#[async_trait]
pub trait MessageChannel: Send {
    /// Subscribe to a topic filter. Matching messages are buffered until
    /// [`drain_received`](Self::drain_received) is called.
    async fn subscribe(&mut self, filter: &str) -> Result<(), ChannelError>;

    /// Publish `payload` on `topic`.
    ///
    /// Returns `false` when the publication was suppressed because
    /// `only_if_changed` was set and the payload did not change.
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<bool, ChannelError>;

    /// Return and clear every message buffered since the last drain.
    fn drain_received(&mut self) -> Vec<ReceivedMessage>;
}

/// What a connector needs to know to open a device channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Index of the bus in the configuration.
    pub bus: usize,
    /// Index of the device on its bus.
    pub slot: usize,
    /// The device's topic prefix.
    pub topic_prefix: String,
    /// QoS used for the channel's last will.
    pub qos: Qos,
}

/// Factory for device channels.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    type Channel: MessageChannel + 'static;

    /// Open a channel for one device with inbound buffering enabled.
    async fn connect(&self, request: &ChannelRequest) -> Result<Self::Channel, ChannelError>;
}

/// Last-published payload per topic, backing change suppression.
#[derive(Debug, Default, Clone)]
pub struct ChangeTracker {
    last: HashMap<String, Vec<u8>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a publication with these options should go out.
    pub fn should_publish(&self, topic: &str, payload: &[u8], options: &PublishOptions) -> bool {
        if !options.only_if_changed {
            return true;
        }
        self.last.get(topic).is_none_or(|last| last.as_slice() != payload)
    }

    /// Remember a payload after it was handed to the broker.
    pub fn record(&mut self, topic: &str, payload: &[u8]) {
        match self.last.get_mut(topic) {
            Some(last) => {
                last.clear();
                last.extend_from_slice(payload);
            }
            None => {
                self.last.insert(topic.to_string(), payload.to_vec());
            }
        }
    }

    /// Last payload sent on `topic`.
    pub fn last(&self, topic: &str) -> Option<&[u8]> {
        self.last.get(topic).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_conversion() {
        assert_eq!(Qos::try_from(0).unwrap(), Qos::AtMostOnce);
        assert_eq!(Qos::try_from(2).unwrap(), Qos::ExactlyOnce);
        assert_eq!(Qos::try_from(3), Err(ChannelError::InvalidQos(3)));
        assert_eq!(u8::from(Qos::AtLeastOnce), 1);
    }

    #[test]
    fn test_qos_deserialize() {
        let qos: Qos = serde_json::from_str("1").unwrap();
        assert_eq!(qos, Qos::AtLeastOnce);
        assert!(serde_json::from_str::<Qos>("7").is_err());
    }

    #[test]
    fn test_change_tracker() {
        let mut tracker = ChangeTracker::new();
        let opts = PublishOptions::default();

        assert!(tracker.should_publish("d/status", b"online", &opts));
        tracker.record("d/status", b"online");
        assert!(!tracker.should_publish("d/status", b"online", &opts));
        assert!(tracker.should_publish("d/status", b"offline", &opts));

        // Events are never suppressed
        assert!(tracker.should_publish("d/status", b"online", &PublishOptions::event(Qos::AtMostOnce)));
        assert_eq!(tracker.last("d/status"), Some(&b"online"[..]));
    }

    #[test]
    fn test_received_payload_str() {
        let msg = ReceivedMessage::new("d/relais0", b"1".to_vec());
        assert_eq!(msg.payload_str(), "1");
    }
}
