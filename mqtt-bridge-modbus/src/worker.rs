//! Bus worker: the per-bus polling loop.
//!
//! One worker owns one field-bus port and walks the bus's devices in
//! configured order, forever. Per device it keeps a slot with the cached
//! identity, the last poll time and the lazily opened message channel.
//! Errors never leave a device's cycle: they turn into an `offline` status
//! and a fixed back-off, and the next pass retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use mbgate_common::{Format, TopicBuilder};
use mbgate_framework::{
    ChannelConnector, ChannelRequest, DeviceStatus, GatewayHealth, MessageChannel,
    PublishOptions,
};

use crate::codec::{CodecContext, normalize_commands};
use crate::config::{BusConfig, DeviceConfig};
use crate::error::DeviceError;
use crate::identity::{DeviceIdentity, IdentityField};
use crate::port::FieldBus;
use crate::registry::CodecRegistry;
use crate::scheduler::should_poll;

/// Pause between two full passes over a bus.
pub const PASS_INTERVAL: Duration = Duration::from_millis(10);

/// Pause after a device's cycle failed.
pub const BACKOFF: Duration = Duration::from_secs(1);

/// Where a device is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Vendor or product still unknown.
    Unidentified,
    /// Vendor and product known; not subscribed (yet, or ever when no codec
    /// matches).
    Identified,
    /// Command topic subscribed, not polled yet.
    Subscribed,
    /// Polled at least once.
    Polling,
}

struct DeviceSlot<Ch> {
    topics: TopicBuilder,
    identity: DeviceIdentity,
    state: DeviceState,
    last_poll: Option<Instant>,
    channel: Option<Ch>,
    status: DeviceStatus,
}

/// Polls every device of one bus.
pub struct BusWorker<P: FieldBus, C: ChannelConnector> {
    bus_index: usize,
    bus: Arc<BusConfig>,
    port: P,
    connector: C,
    registry: Arc<CodecRegistry>,
    slots: Vec<DeviceSlot<C::Channel>>,
    format: Format,
    health: Option<Arc<GatewayHealth>>,
    pass_interval: Duration,
    backoff: Duration,
}

impl<P: FieldBus, C: ChannelConnector> BusWorker<P, C> {
    pub fn new(
        bus_index: usize,
        bus: Arc<BusConfig>,
        port: P,
        connector: C,
        registry: Arc<CodecRegistry>,
    ) -> Self {
        let slots = bus
            .devices
            .iter()
            .map(|device| DeviceSlot {
                topics: TopicBuilder::new(&device.maintopic),
                identity: DeviceIdentity::new(),
                state: DeviceState::Unidentified,
                last_poll: None,
                channel: None,
                status: DeviceStatus::Unknown,
            })
            .collect();

        Self {
            bus_index,
            bus,
            port,
            connector,
            registry,
            slots,
            format: Format::default(),
            health: None,
            pass_interval: PASS_INTERVAL,
            backoff: BACKOFF,
        }
    }

    /// Encoding of structured data documents.
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Report every device cycle to `health`.
    pub fn with_health(mut self, health: Arc<GatewayHealth>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_timing(mut self, pass_interval: Duration, backoff: Duration) -> Self {
        self.pass_interval = pass_interval;
        self.backoff = backoff;
        self
    }

    pub fn bus_index(&self) -> usize {
        self.bus_index
    }

    /// Number of device slots.
    pub fn devices(&self) -> usize {
        self.slots.len()
    }

    pub fn state(&self, slot: usize) -> Option<DeviceState> {
        self.slots.get(slot).map(|s| s.state)
    }

    pub fn identity(&self, slot: usize) -> Option<&DeviceIdentity> {
        self.slots.get(slot).map(|s| &s.identity)
    }

    pub fn last_poll(&self, slot: usize) -> Option<Instant> {
        self.slots.get(slot).and_then(|s| s.last_poll)
    }

    /// Last status reported for a device.
    pub fn status(&self, slot: usize) -> Option<DeviceStatus> {
        self.slots.get(slot).map(|s| s.status)
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Poll the bus until the task is aborted.
    pub async fn run(mut self) {
        tracing::info!(
            bus = self.bus_index,
            devices = self.slots.len(),
            "Bus worker started"
        );

        loop {
            self.run_pass().await;
            tokio::time::sleep(self.pass_interval).await;
        }
    }

    /// One pass over every device in configured order.
    pub async fn run_pass(&mut self) {
        for slot in 0..self.slots.len() {
            let now = Instant::now();
            if let Err(error) = self.cycle_device(slot, now).await {
                self.handle_failure(slot, error).await;
            }
        }
    }

    async fn cycle_device(&mut self, slot: usize, now: Instant) -> Result<(), DeviceError> {
        let BusWorker {
            bus_index,
            bus,
            port,
            connector,
            registry,
            slots,
            format,
            health,
            ..
        } = self;
        let config = &bus.devices[slot];
        let device = &mut slots[slot];

        let channel = match device.channel.take() {
            Some(channel) => device.channel.insert(channel),
            None => {
                let request = ChannelRequest {
                    bus: *bus_index,
                    slot,
                    topic_prefix: device.topics.prefix().to_string(),
                    qos: config.qos,
                };
                let channel = connector.connect(&request).await?;
                tracing::debug!(bus = *bus_index, device = %device.topics.prefix(), "Channel opened");
                device.channel.insert(channel)
            }
        };

        // Identification runs every pass, due or not.
        device.identity.resolve(config, port).await?;

        if let Some(missing) = device.identity.missing() {
            return Err(DeviceError::Unidentified { missing });
        }
        let Some((vendor, product)) = device.identity.key() else {
            return Ok(());
        };

        if device.state == DeviceState::Unidentified {
            tracing::info!(
                bus = *bus_index,
                device = %device.topics.prefix(),
                address = config.address,
                vendor,
                product,
                "Device identified"
            );
            device.state = DeviceState::Identified;
        }

        let codec = match registry.lookup(vendor, product).into_result(vendor, product) {
            Ok(codec) => codec.clone(),
            Err(error) => {
                publish_identity(channel, &device.topics, &device.identity, config).await?;
                return Err(error);
            }
        };

        if !device.identity.topic_announced {
            let filter = device.topics.command_filter();
            channel.subscribe(&filter).await?;
            device.identity.topic_announced = true;
            device.state = DeviceState::Subscribed;
            tracing::info!(
                bus = *bus_index,
                device = %device.topics.prefix(),
                codec = codec.name(),
                filter = %filter,
                "Subscribed to commands"
            );
        }

        if !should_poll(now, device.last_poll, config.min_interval()) {
            return Ok(());
        }

        publish_identity(channel, &device.topics, &device.identity, config).await?;

        let commands = normalize_commands(&device.topics, channel.drain_received());
        let mut ctx = CodecContext::new(&device.topics, &device.identity, config, *format, commands);
        codec.cycle(port, channel, &mut ctx).await?;

        channel
            .publish(
                &device.topics.status(),
                DeviceStatus::Online.as_str().as_bytes(),
                PublishOptions::retained_if_changed(config.qos),
            )
            .await?;

        device.last_poll = Some(now);
        device.state = DeviceState::Polling;
        if device.status != DeviceStatus::Online {
            tracing::info!(bus = *bus_index, device = %device.topics.prefix(), "Device online");
        }
        device.status = DeviceStatus::Online;

        tracing::debug!(
            bus = *bus_index,
            device = %device.topics.prefix(),
            codec = codec.name(),
            "Polled device"
        );

        if let Some(health) = health {
            health.record_online(&health_key(*bus_index, slot));
        }

        Ok(())
    }

    async fn handle_failure(&mut self, slot: usize, error: DeviceError) {
        let bus_index = self.bus_index;
        let config = &self.bus.devices[slot];
        let device = &mut self.slots[slot];
        let went_offline = device.status != DeviceStatus::Offline;

        match &error {
            DeviceError::Unidentified { .. } | DeviceError::UnknownDevice { .. } if !went_offline => {
                tracing::debug!(bus = bus_index, device = %device.topics.prefix(), error = %error, "Device still unknown");
            }
            DeviceError::UnknownDevice { vendor, product, reason } => {
                tracing::warn!(
                    bus = bus_index,
                    device = %device.topics.prefix(),
                    address = config.address,
                    vendor = %vendor,
                    product = %product,
                    "No codec for device: {}",
                    reason
                );
            }
            DeviceError::Unidentified { missing } => {
                tracing::warn!(
                    bus = bus_index,
                    device = %device.topics.prefix(),
                    address = config.address,
                    "Device did not report its {}",
                    missing
                );
            }
            DeviceError::Transport(e) => {
                tracing::warn!(
                    bus = bus_index,
                    device = %device.topics.prefix(),
                    address = config.address,
                    error = %e,
                    "Field bus error"
                );
            }
            DeviceError::Channel(e) => {
                tracing::warn!(bus = bus_index, device = %device.topics.prefix(), error = %e, "Message channel error");
            }
            DeviceError::Codec(e) => {
                tracing::warn!(bus = bus_index, device = %device.topics.prefix(), error = %e, "Codec failed");
            }
        }

        if let Some(channel) = device.channel.as_mut() {
            let result = channel
                .publish(
                    &device.topics.status(),
                    DeviceStatus::Offline.as_str().as_bytes(),
                    PublishOptions::retained_if_changed(config.qos),
                )
                .await;
            if let Err(e) = result {
                tracing::debug!(device = %device.topics.prefix(), error = %e, "Failed to publish offline status");
            }
        }

        if went_offline {
            tracing::info!(bus = bus_index, device = %device.topics.prefix(), "Device offline");
        }
        device.status = DeviceStatus::Offline;

        if let Some(health) = &self.health {
            health.record_offline(&health_key(bus_index, slot), &error.to_string());
        }

        tokio::time::sleep(self.backoff).await;
    }
}

/// Device key used in health reports.
pub fn health_key(bus: usize, slot: usize) -> String {
    format!("{}/{}", bus, slot)
}

/// Publish the identity fields known so far, retained and only on change.
async fn publish_identity(
    channel: &mut dyn MessageChannel,
    topics: &TopicBuilder,
    identity: &DeviceIdentity,
    config: &DeviceConfig,
) -> Result<(), DeviceError> {
    let options = PublishOptions::retained_if_changed(config.qos);
    for field in IdentityField::ALL {
        if let Some(value) = identity.get(field) {
            channel
                .publish(&topics.field(field.as_str()), value.as_bytes(), options)
                .await?;
        }
    }
    Ok(())
}
