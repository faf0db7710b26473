//! MQTT implementation of the message channel.
//!
//! Each device gets its own broker session (client id
//! `<mqtt.id>-<bus>-<slot>`) with a retained `offline` last will on its
//! status topic. A background task drives the `rumqttc` event loop and
//! appends inbound publications to a bounded shared buffer. Publishing and
//! subscribing never wait on the event loop: a full request queue is an
//! error for that cycle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;

use mbgate_common::{MqttConfig, TopicBuilder};

use crate::channel::{
    ChangeTracker, ChannelConnector, ChannelRequest, MessageChannel, PublishOptions, Qos,
    ReceivedMessage,
};
use crate::error::ChannelError;
use crate::status::DeviceStatus;

/// Request queue depth between the client handle and its event loop.
const CHANNEL_CAPACITY: usize = 64;

/// Delay before the event loop retries after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Inbound messages kept between two drains; the oldest go first.
pub const INBOUND_CAPACITY: usize = 256;

type Inbound = Arc<Mutex<VecDeque<ReceivedMessage>>>;

/// MQTT filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    rumqttc::matches(topic, filter)
}

/// Append `message`, dropping the oldest entries beyond `capacity`.
/// Returns how many were dropped.
fn push_bounded(
    buffer: &mut VecDeque<ReceivedMessage>,
    message: ReceivedMessage,
    capacity: usize,
) -> usize {
    buffer.push_back(message);
    let excess = buffer.len().saturating_sub(capacity);
    buffer.drain(..excess);
    excess
}

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Opens MQTT channels using the global broker settings.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: MqttConfig,
}

impl MqttConnector {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    /// Open a channel with an explicit client id and retained last will.
    pub fn open(
        &self,
        client_id: &str,
        will_topic: &str,
        will_payload: &[u8],
        will_qos: Qos,
    ) -> MqttChannel {
        let mut options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        if self.config.has_credentials() {
            options.set_credentials(&self.config.username, &self.config.password);
        }
        options.set_last_will(LastWill::new(
            will_topic,
            will_payload.to_vec(),
            will_qos.into(),
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);
        let inbound = Arc::new(Mutex::new(VecDeque::new()));
        let filters = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn(drive_event_loop(
            client_id.to_string(),
            eventloop,
            client.clone(),
            inbound.clone(),
            filters.clone(),
        ));

        tracing::debug!(
            client_id = %client_id,
            host = %self.config.host,
            port = self.config.port,
            "Opened MQTT channel"
        );

        MqttChannel {
            client_id: client_id.to_string(),
            client,
            inbound,
            filters,
            changes: ChangeTracker::new(),
            task,
        }
    }
}

#[async_trait]
impl ChannelConnector for MqttConnector {
    type Channel = MqttChannel;

    async fn connect(&self, request: &ChannelRequest) -> Result<MqttChannel, ChannelError> {
        let client_id = self.config.client_id(request.bus, request.slot);
        let topics = TopicBuilder::new(&request.topic_prefix);
        Ok(self.open(
            &client_id,
            &topics.status(),
            DeviceStatus::Offline.as_str().as_bytes(),
            request.qos,
        ))
    }
}

/// One broker session with buffered inbound messages.
pub struct MqttChannel {
    client_id: String,
    client: AsyncClient,
    inbound: Inbound,
    filters: Arc<Mutex<Vec<(String, QoS)>>>,
    changes: ChangeTracker,
    task: JoinHandle<()>,
}

impl MqttChannel {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl MessageChannel for MqttChannel {
    async fn subscribe(&mut self, filter: &str) -> Result<(), ChannelError> {
        let qos = QoS::AtLeastOnce;
        self.client
            .try_subscribe(filter, qos)
            .map_err(|e| ChannelError::Subscribe {
                filter: filter.to_string(),
                message: e.to_string(),
            })?;

        self.filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((filter.to_string(), qos));

        tracing::debug!(client_id = %self.client_id, filter = %filter, "Subscribed");
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<bool, ChannelError> {
        if !self.changes.should_publish(topic, payload, &options) {
            return Ok(false);
        }

        self.client
            .try_publish(topic, options.qos.into(), options.persistent, payload.to_vec())
            .map_err(|e| ChannelError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        self.changes.record(topic, payload);
        Ok(true)
    }

    fn drain_received(&mut self) -> Vec<ReceivedMessage> {
        let mut inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        inbound.drain(..).collect()
    }
}

/// Poll the event loop forever, buffering publications and restoring
/// subscriptions after every reconnect.
async fn drive_event_loop(
    client_id: String,
    mut eventloop: EventLoop,
    client: AsyncClient,
    inbound: Inbound,
    filters: Arc<Mutex<Vec<(String, QoS)>>>,
) {
    let mut connected_before = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = ReceivedMessage::new(publish.topic, publish.payload.to_vec());
                let dropped = push_bounded(
                    &mut inbound.lock().unwrap_or_else(PoisonError::into_inner),
                    message,
                    INBOUND_CAPACITY,
                );
                if dropped > 0 {
                    tracing::warn!(
                        client_id = %client_id,
                        dropped,
                        "Inbound buffer full, dropped oldest message"
                    );
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::debug!(client_id = %client_id, "MQTT session established");
                if connected_before {
                    let filters = filters
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    for (filter, qos) in filters {
                        if let Err(e) = client.try_subscribe(filter.clone(), qos) {
                            tracing::warn!(
                                client_id = %client_id,
                                filter = %filter,
                                error = %e,
                                "Failed to restore subscription"
                            );
                        }
                    }
                }
                connected_before = true;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(client_id = %client_id, error = %e, "MQTT connection error");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(QoS::from(Qos::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(QoS::from(Qos::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::from(Qos::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[test]
    fn test_command_filter_covers_device_topics() {
        let topics = TopicBuilder::new("home/io88");
        let filter = topics.command_filter();

        assert!(topic_matches(&filter, &topics.cmd()));
        assert!(topic_matches(&filter, &topics.field("output3")));
        assert!(!topic_matches(&filter, "home/io88/nested/output3"));
        assert!(!topic_matches(&filter, "home/other/output3"));
        assert!(topic_matches("home/#", "home/io88/nested/output3"));
    }

    #[test]
    fn test_inbound_buffer_drops_oldest() {
        let mut buffer = VecDeque::new();
        for i in 0..3 {
            let message = ReceivedMessage::new(format!("t/{}", i), "x");
            assert_eq!(push_bounded(&mut buffer, message, 3), 0);
        }

        assert_eq!(push_bounded(&mut buffer, ReceivedMessage::new("t/3", "x"), 3), 1);
        let topics: Vec<_> = buffer.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, vec!["t/1", "t/2", "t/3"]);
    }

    fn unreachable_connector() -> MqttConnector {
        MqttConnector::new(MqttConfig {
            id: "gw".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            username: String::new(),
            password: String::new(),
            maintopic: "gw".to_string(),
            keep_alive_secs: 30,
        })
    }

    #[tokio::test]
    async fn test_connector_scopes_client_id() {
        let connector = unreachable_connector();
        let request = ChannelRequest {
            bus: 2,
            slot: 4,
            topic_prefix: "home/dev".to_string(),
            qos: Qos::AtMostOnce,
        };

        let mut channel = connector.connect(&request).await.unwrap();
        assert_eq!(channel.client_id(), "gw-2-4");
        assert!(channel.drain_received().is_empty());
    }

    #[tokio::test]
    async fn test_publish_without_broker_does_not_block() {
        let connector = unreachable_connector();
        let mut channel = connector.open("gw-0-0", "dev/status", b"offline", Qos::AtMostOnce);

        let published = tokio::time::timeout(Duration::from_secs(5), async {
            let mut failed = 0;
            for i in 0..CHANNEL_CAPACITY * 2 {
                let payload = i.to_string();
                let options = PublishOptions::retained_if_changed(Qos::AtMostOnce);
                let result = channel.publish("dev/count", payload.as_bytes(), options).await;
                if result.is_err() {
                    failed += 1;
                }
            }
            failed
        })
        .await;

        // The queue fills up while the broker is unreachable.
        let failed = published.expect("publish blocked on a full request queue");
        assert!(failed > 0);
    }
}
