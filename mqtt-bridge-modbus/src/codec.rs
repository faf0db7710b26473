//! Codec contract.
//!
//! A codec knows one device model: it reads the device's registers,
//! publishes named values and turns inbound commands into register writes.
//! The bus worker calls [`Codec::cycle`] once per due poll.

use async_trait::async_trait;
use serde_json::Value;

use mbgate_common::topic::{CMD_FIELD, HEALTH_FIELD, RESERVED_FIELDS};
use mbgate_common::{DataDocument, FieldValue, Format, TopicBuilder, decode_auto, encode};
use mbgate_framework::{MessageChannel, PublishOptions, ReceivedMessage};

use crate::config::DeviceConfig;
use crate::error::DeviceError;
use crate::identity::DeviceIdentity;
use crate::port::FieldBus;

/// One device model's poll-and-publish logic.
///
/// Errors from the port must be returned, not swallowed, so the worker can
/// mark the device offline. Failures of optional sub-readings may be
/// handled inside the codec to keep the rest of the cycle.
#[async_trait]
pub trait Codec: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Poll the device, publish its values and apply pending commands.
    async fn cycle(
        &self,
        port: &mut dyn FieldBus,
        channel: &mut dyn MessageChannel,
        ctx: &mut CodecContext<'_>,
    ) -> Result<(), DeviceError>;
}

/// A write request addressed to one field of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub field: String,
    pub value: String,
}

impl Command {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Boolean reading of the value: `0`, `false` and `off` are off.
    pub fn as_switch(&self) -> bool {
        FieldValue::parse_switch(&self.value)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value.trim().parse().ok()
    }

    /// Register value. Negative numbers down to -32768 are written as their
    /// two's complement.
    pub fn as_u16(&self) -> Option<u16> {
        let value: i64 = self.value.trim().parse().ok()?;
        match value {
            0..=0xFFFF => Some(value as u16),
            -0x8000..=-1 => Some(value as i16 as u16),
            _ => None,
        }
    }

    /// Index of a numbered field: `output3` with prefix `output` is 3.
    pub fn index_of(&self, prefix: &str) -> Option<u16> {
        let digits = self.field.strip_prefix(prefix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

/// Turn drained messages into commands, preserving arrival order.
///
/// A `<prefix>/cmd` message carries an object of field/value pairs, JSON or
/// CBOR, applied in document order; any other `<prefix>/<field>` message
/// is a bare value for that field.
/// Echoes of the gateway's own status, identity and data topics are
/// dropped.
pub fn normalize_commands(topics: &TopicBuilder, messages: Vec<ReceivedMessage>) -> Vec<Command> {
    let mut commands = Vec::new();

    for message in messages {
        let Some(field) = topics.field_of(&message.topic) else {
            continue;
        };

        if field == CMD_FIELD {
            match decode_auto::<Value>(&message.payload) {
                Ok(Value::Object(fields)) => {
                    commands.extend(
                        fields
                            .into_iter()
                            .filter_map(|(name, value)| Some(Command::new(name, json_text(value)?))),
                    );
                }
                Ok(_) => {
                    tracing::warn!(topic = %message.topic, "Command document is not an object");
                }
                Err(e) => {
                    tracing::warn!(topic = %message.topic, error = %e, "Invalid command document");
                }
            }
        } else if !RESERVED_FIELDS.contains(&field) && field != HEALTH_FIELD {
            commands.push(Command::new(field, message.payload_str().trim()));
        }
    }

    commands
}

fn json_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(FieldValue::Bool(b).to_payload()),
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Everything a codec knows about the device it is polling.
pub struct CodecContext<'a> {
    pub address: u8,
    pub topics: &'a TopicBuilder,
    pub identity: &'a DeviceIdentity,
    pub config: &'a DeviceConfig,
    /// Encoding of structured documents.
    pub format: Format,
    commands: Vec<Command>,
}

impl<'a> CodecContext<'a> {
    pub fn new(
        topics: &'a TopicBuilder,
        identity: &'a DeviceIdentity,
        config: &'a DeviceConfig,
        format: Format,
        commands: Vec<Command>,
    ) -> Self {
        Self {
            address: config.address,
            topics,
            identity,
            config,
            format,
            commands,
        }
    }

    /// Take the commands received since the previous cycle. A second call
    /// in the same cycle returns nothing.
    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn options(&self) -> PublishOptions {
        self.config.publish_options()
    }

    /// Publish `<prefix>/<field>` with the device's publish options.
    pub async fn publish(
        &self,
        channel: &mut dyn MessageChannel,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<bool, DeviceError> {
        let payload = value.into().to_payload();
        let published = channel
            .publish(&self.topics.field(field), payload.as_bytes(), self.options())
            .await?;
        Ok(published)
    }

    /// Publish a one-shot event: never retained, never suppressed.
    pub async fn publish_event(
        &self,
        channel: &mut dyn MessageChannel,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<bool, DeviceError> {
        let payload = value.into().to_payload();
        let published = channel
            .publish(
                &self.topics.field(field),
                payload.as_bytes(),
                PublishOptions::event(self.config.qos),
            )
            .await?;
        Ok(published)
    }

    /// Publish a structured document on `<prefix>/data`.
    pub async fn publish_data(
        &self,
        channel: &mut dyn MessageChannel,
        document: &DataDocument,
    ) -> Result<bool, DeviceError> {
        let payload =
            encode(document, self.format).map_err(|e| DeviceError::codec(e.to_string()))?;
        let published = channel
            .publish(&self.topics.data(), &payload, self.options())
            .await?;
        Ok(published)
    }
}
