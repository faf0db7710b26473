//! Modbus to MQTT gateway.
//!
//! Polls Modbus devices (TCP or RTU/serial), publishes their state to MQTT
//! and relays MQTT commands back to the bus as register writes.
//!
//! # Topics
//!
//! ```text
//! <prefix>/<field>                  values published by the device's codec
//! <prefix>/vendor|product|version   device identity (retained)
//! <prefix>/status                   online | offline (retained, last will)
//! <prefix>/data                     structured document (register-map codec)
//! <prefix>/cmd, <prefix>/<field>    inbound commands
//! ```
//!
//! Where `<prefix>` is the device's configured `maintopic`.
//!
//! # Structure
//!
//! - [`worker::BusWorker`] owns one bus: identity resolution, codec lookup,
//!   command subscription and the poll gate, per device in configured order.
//! - [`registry::CodecRegistry`] maps (vendor, product) to a [`codec::Codec`].
//! - [`port::ModbusPort`] talks to the bus; [`mock`] has in-memory
//!   stand-ins for tests.

pub mod codec;
pub mod codecs;
pub mod config;
pub mod decode;
pub mod error;
pub mod identity;
pub mod mock;
pub mod port;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use codec::{Codec, CodecContext, Command};
pub use codecs::builtin_registry;
pub use config::{BusConfig, DeviceConfig, ModbusGatewayConfig};
pub use error::{DeviceError, RegistryError, TransportError};
pub use identity::{DeviceIdentity, IdentityField};
pub use port::{FieldBus, ModbusPort};
pub use registry::{CodecRegistry, Lookup};
pub use scheduler::should_poll;
pub use worker::{BusWorker, DeviceState};
