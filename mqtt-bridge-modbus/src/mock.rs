//! In-memory field bus and message channel.
//!
//! Used by the test suites and handy for codec authors: [`MockPort`] serves
//! scripted registers and identity strings and records every request,
//! [`MockConnector`] hands out [`MockChannel`]s that record publications and
//! deliver injected messages the way a broker would.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use mbgate_framework::{
    ChangeTracker, ChannelConnector, ChannelError, ChannelRequest, MessageChannel,
    PublishOptions, ReceivedMessage, topic_matches,
};

use crate::error::TransportError;
use crate::identity::IdentityField;
use crate::port::FieldBus;

/// One request seen by a [`MockPort`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortCall {
    ReadDiscreteInputs { address: u8, start: u16, count: u16 },
    ReadCoils { address: u8, start: u16, count: u16 },
    WriteCoil { address: u8, index: u16, value: bool },
    ReadInputRegisters { address: u8, start: u16, count: u16 },
    ReadHoldingRegisters { address: u8, start: u16, count: u16 },
    WriteRegister { address: u8, index: u16, value: u16 },
    Identify { address: u8, field: IdentityField },
}

impl PortCall {
    pub fn address(&self) -> u8 {
        match self {
            PortCall::ReadDiscreteInputs { address, .. }
            | PortCall::ReadCoils { address, .. }
            | PortCall::WriteCoil { address, .. }
            | PortCall::ReadInputRegisters { address, .. }
            | PortCall::ReadHoldingRegisters { address, .. }
            | PortCall::WriteRegister { address, .. }
            | PortCall::Identify { address, .. } => *address,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, PortCall::WriteCoil { .. } | PortCall::WriteRegister { .. })
    }
}

/// Scriptable field bus. Unset registers read as zero, unset bits as off.
#[derive(Debug, Default)]
pub struct MockPort {
    discrete: HashMap<(u8, u16), bool>,
    coils: HashMap<(u8, u16), bool>,
    input: HashMap<(u8, u16), u16>,
    holding: HashMap<(u8, u16), u16>,
    identities: HashMap<(u8, IdentityField), String>,
    failures: HashMap<u8, TransportError>,
    identify_failures: HashMap<(u8, IdentityField), TransportError>,
    calls: Vec<PortCall>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_identity(&mut self, address: u8, field: IdentityField, value: &str) {
        self.identities.insert((address, field), value.to_string());
    }

    pub fn set_discrete(&mut self, address: u8, index: u16, value: bool) {
        self.discrete.insert((address, index), value);
    }

    pub fn set_coil(&mut self, address: u8, index: u16, value: bool) {
        self.coils.insert((address, index), value);
    }

    /// Set consecutive input registers starting at `start`.
    pub fn set_input(&mut self, address: u8, start: u16, values: &[u16]) {
        for (offset, value) in values.iter().enumerate() {
            self.input.insert((address, start + offset as u16), *value);
        }
    }

    /// Set consecutive holding registers starting at `start`.
    pub fn set_holding(&mut self, address: u8, start: u16, values: &[u16]) {
        for (offset, value) in values.iter().enumerate() {
            self.holding.insert((address, start + offset as u16), *value);
        }
    }

    pub fn coil(&self, address: u8, index: u16) -> bool {
        self.coils.get(&(address, index)).copied().unwrap_or(false)
    }

    pub fn holding(&self, address: u8, index: u16) -> u16 {
        self.holding.get(&(address, index)).copied().unwrap_or(0)
    }

    /// Make every request to `address` fail with `error`.
    pub fn fail(&mut self, address: u8, error: TransportError) {
        self.failures.insert(address, error);
    }

    pub fn recover(&mut self, address: u8) {
        self.failures.remove(&address);
    }

    /// Make identification of one field fail.
    pub fn fail_identify(&mut self, address: u8, field: IdentityField, error: TransportError) {
        self.identify_failures.insert((address, field), error);
    }

    pub fn recover_identify(&mut self, address: u8, field: IdentityField) {
        self.identify_failures.remove(&(address, field));
    }

    pub fn calls(&self) -> &[PortCall] {
        &self.calls
    }

    pub fn calls_for(&self, address: u8) -> Vec<PortCall> {
        self.calls
            .iter()
            .filter(|call| call.address() == address)
            .cloned()
            .collect()
    }

    pub fn writes(&self) -> Vec<PortCall> {
        self.calls.iter().filter(|call| call.is_write()).cloned().collect()
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    fn record(&mut self, call: PortCall) -> Result<(), TransportError> {
        let address = call.address();
        self.calls.push(call);
        match self.failures.get(&address) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

fn read_bits(map: &HashMap<(u8, u16), bool>, address: u8, start: u16, count: u16) -> Vec<bool> {
    (start..start.saturating_add(count))
        .map(|index| map.get(&(address, index)).copied().unwrap_or(false))
        .collect()
}

fn read_words(map: &HashMap<(u8, u16), u16>, address: u8, start: u16, count: u16) -> Vec<u16> {
    (start..start.saturating_add(count))
        .map(|index| map.get(&(address, index)).copied().unwrap_or(0))
        .collect()
}

#[async_trait]
impl FieldBus for MockPort {
    async fn read_discrete_inputs(
        &mut self,
        address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.record(PortCall::ReadDiscreteInputs {
            address,
            start,
            count,
        })?;
        Ok(read_bits(&self.discrete, address, start, count))
    }

    async fn read_coils(
        &mut self,
        address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.record(PortCall::ReadCoils {
            address,
            start,
            count,
        })?;
        Ok(read_bits(&self.coils, address, start, count))
    }

    async fn write_coil(
        &mut self,
        address: u8,
        index: u16,
        value: bool,
    ) -> Result<(), TransportError> {
        self.record(PortCall::WriteCoil {
            address,
            index,
            value,
        })?;
        self.coils.insert((address, index), value);
        Ok(())
    }

    async fn read_input_registers(
        &mut self,
        address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.record(PortCall::ReadInputRegisters {
            address,
            start,
            count,
        })?;
        Ok(read_words(&self.input, address, start, count))
    }

    async fn read_holding_registers(
        &mut self,
        address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.record(PortCall::ReadHoldingRegisters {
            address,
            start,
            count,
        })?;
        Ok(read_words(&self.holding, address, start, count))
    }

    async fn write_register(
        &mut self,
        address: u8,
        index: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        self.record(PortCall::WriteRegister {
            address,
            index,
            value,
        })?;
        self.holding.insert((address, index), value);
        Ok(())
    }

    async fn identify(
        &mut self,
        address: u8,
        field: IdentityField,
    ) -> Result<String, TransportError> {
        self.record(PortCall::Identify { address, field })?;
        if let Some(error) = self.identify_failures.get(&(address, field)) {
            return Err(error.clone());
        }
        Ok(self
            .identities
            .get(&(address, field))
            .cloned()
            .unwrap_or_default())
    }
}

/// A publication recorded by a [`MockChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

impl Publication {
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    published: Vec<Publication>,
    subscriptions: Vec<String>,
    inbound: Vec<ReceivedMessage>,
    changes: ChangeTracker,
    drains: usize,
    fail_publish: bool,
}

/// Recording message channel. Clones share state, so a test can keep a
/// handle while the worker owns the channel.
#[derive(Debug, Clone, Default)]
pub struct MockChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every publication that went out (suppressed ones are not recorded).
    pub fn published(&self) -> Vec<Publication> {
        self.state().published.clone()
    }

    /// Payloads published on `topic`, oldest first.
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.state()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload_str().into_owned())
            .collect()
    }

    pub fn last_payload(&self, topic: &str) -> Option<String> {
        self.payloads(topic).pop()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state().subscriptions.clone()
    }

    /// Deliver a message as the broker would: it is buffered only if it
    /// matches a subscribed filter. Returns whether it was buffered.
    pub fn inject(&self, topic: &str, payload: &str) -> bool {
        let mut state = self.state();
        if !state
            .subscriptions
            .iter()
            .any(|filter| topic_matches(filter, topic))
        {
            return false;
        }
        state
            .inbound
            .push(ReceivedMessage::new(topic, payload.as_bytes()));
        true
    }

    /// Messages buffered and not yet drained.
    pub fn pending(&self) -> usize {
        self.state().inbound.len()
    }

    /// How often the buffer was drained.
    pub fn drain_count(&self) -> usize {
        self.state().drains
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.state().fail_publish = fail;
    }

    pub fn clear_published(&self) {
        self.state().published.clear();
    }
}

#[async_trait]
impl MessageChannel for MockChannel {
    async fn subscribe(&mut self, filter: &str) -> Result<(), ChannelError> {
        let mut state = self.state();
        if !state.subscriptions.iter().any(|f| f == filter) {
            state.subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<bool, ChannelError> {
        let mut state = self.state();
        if state.fail_publish {
            return Err(ChannelError::Publish {
                topic: topic.to_string(),
                message: "mock publish failure".to_string(),
            });
        }
        if !state.changes.should_publish(topic, payload, &options) {
            return Ok(false);
        }

        state.changes.record(topic, payload);
        state.published.push(Publication {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            options,
        });
        Ok(true)
    }

    fn drain_received(&mut self) -> Vec<ReceivedMessage> {
        let mut state = self.state();
        state.drains += 1;
        std::mem::take(&mut state.inbound)
    }
}

/// Connector handing out [`MockChannel`]s, keyed by bus and slot.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    channels: Arc<Mutex<BTreeMap<(usize, usize), MockChannel>>>,
    requests: Arc<Mutex<Vec<ChannelRequest>>>,
    fail_connect: Arc<Mutex<bool>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following connect attempt fail.
    pub fn set_fail_connect(&self, fail: bool) {
        *self.fail_connect.lock().unwrap_or_else(PoisonError::into_inner) = fail;
    }

    /// Channel opened for `slot` on `bus`, if any.
    pub fn channel(&self, bus: usize, slot: usize) -> Option<MockChannel> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bus, slot))
            .cloned()
    }

    pub fn requests(&self) -> Vec<ChannelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    type Channel = MockChannel;

    async fn connect(&self, request: &ChannelRequest) -> Result<MockChannel, ChannelError> {
        if *self.fail_connect.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(ChannelError::Connect {
                client_id: format!("mock-{}-{}", request.bus, request.slot),
                message: "mock connect failure".to_string(),
            });
        }
        let channel = MockChannel::new();
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((request.bus, request.slot), channel.clone());
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        Ok(channel)
    }
}
