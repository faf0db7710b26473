//! Configurable register-map codec.
//!
//! For devices without a dedicated codec: the device's `registers` list
//! says what to read and how to decode it. All values of one poll go out
//! as a single [`DataDocument`] on `<prefix>/data`. Registers marked
//! `writable` accept commands under their field name.

use std::sync::Arc;

use async_trait::async_trait;

use mbgate_common::{DataDocument, FieldValue};
use mbgate_framework::MessageChannel;

use crate::codec::{Codec, CodecContext, Command};
use crate::config::{DataType, REGISTERS_KEY, RegisterConfig, RegisterType};
use crate::decode::{decode_scaled, decode_value, encode_u16};
use crate::error::{DeviceError, RegistryError, TransportError};
use crate::port::FieldBus;
use crate::registry::CodecRegistry;

pub const VENDOR: &str = "generic";
pub const PRODUCT: &str = "register-map";

pub fn register(registry: &mut CodecRegistry) -> Result<(), RegistryError> {
    registry.register(VENDOR, PRODUCT, Arc::new(RegisterMap))
}

pub struct RegisterMap;

/// Value of one register entry. Integer types without scaling stay
/// integers; everything else becomes a float.
fn register_value(data: &[u16], register: &RegisterConfig) -> Option<FieldValue> {
    let unscaled = register.scale == 1.0 && register.offset == 0.0;
    match register.data_type {
        DataType::U16 | DataType::U32 | DataType::U32Le if unscaled => {
            decode_value(data, register.data_type).map(|v| FieldValue::Unsigned(v as u64))
        }
        DataType::I16 | DataType::I32 | DataType::I32Le if unscaled => {
            decode_value(data, register.data_type).map(|v| FieldValue::Signed(v as i64))
        }
        _ => decode_scaled(data, register).map(FieldValue::Float),
    }
}

async fn read_register(
    port: &mut dyn FieldBus,
    address: u8,
    register: &RegisterConfig,
) -> Result<Option<FieldValue>, TransportError> {
    let count = register.data_type.registers();
    let value = match register.register_type {
        RegisterType::Coil => port
            .read_coils(address, register.address, 1)
            .await?
            .first()
            .map(|bit| FieldValue::Bool(*bit)),
        RegisterType::Discrete => port
            .read_discrete_inputs(address, register.address, 1)
            .await?
            .first()
            .map(|bit| FieldValue::Bool(*bit)),
        RegisterType::Input => {
            let data = port
                .read_input_registers(address, register.address, count)
                .await?;
            register_value(&data, register)
        }
        RegisterType::Holding => {
            let data = port
                .read_holding_registers(address, register.address, count)
                .await?;
            register_value(&data, register)
        }
    };
    Ok(value)
}

async fn apply_command(
    port: &mut dyn FieldBus,
    address: u8,
    registers: &[RegisterConfig],
    command: &Command,
) -> Result<(), DeviceError> {
    let Some(register) = registers
        .iter()
        .find(|r| r.writable && r.register_type.is_writable() && r.field_name() == command.field)
    else {
        return Ok(());
    };

    match register.register_type {
        RegisterType::Coil => {
            port.write_coil(address, register.address, command.as_switch())
                .await?;
        }
        _ => match command.as_f64().and_then(|v| encode_u16(v, register)) {
            Some(raw) => port.write_register(address, register.address, raw).await?,
            None => {
                tracing::warn!(
                    field = %command.field,
                    value = %command.value,
                    data_type = ?register.data_type,
                    "Command value does not fit the register"
                );
            }
        },
    }

    Ok(())
}

#[async_trait]
impl Codec for RegisterMap {
    fn name(&self) -> &str {
        "register-map"
    }

    async fn cycle(
        &self,
        port: &mut dyn FieldBus,
        channel: &mut dyn MessageChannel,
        ctx: &mut CodecContext<'_>,
    ) -> Result<(), DeviceError> {
        let address = ctx.address;
        let registers: Vec<RegisterConfig> =
            ctx.config.sub_config(REGISTERS_KEY)?.unwrap_or_default();

        let mut document = DataDocument::new();
        for register in &registers {
            match read_register(port, address, register).await {
                Ok(Some(value)) => document.insert(register.field_name(), value),
                Ok(None) => {}
                // The device answered; only this entry is bad.
                Err(TransportError::Exception(code)) => {
                    tracing::warn!(
                        address,
                        register = register.address,
                        register_type = register.register_type.as_str(),
                        exception = %code,
                        "Skipping register"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !document.is_empty() {
            ctx.publish_data(channel, &document).await?;
        }

        for command in ctx.take_commands() {
            apply_command(port, address, &registers, &command).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbgate_common::{Format, TopicBuilder, decode};
    use serde_json::json;

    use crate::config::DeviceConfig;
    use crate::identity::DeviceIdentity;
    use crate::mock::{MockChannel, MockPort};

    const ADDR: u8 = 4;

    fn meter() -> DeviceConfig {
        DeviceConfig::new(ADDR, "meter").with_extra(
            REGISTERS_KEY,
            json!([
                { "type": "input", "address": 0, "name": "voltage", "data_type": "u16", "scale": 0.5 },
                { "type": "input", "address": 2, "name": "energy", "data_type": "u32le" },
                { "type": "holding", "address": 10, "name": "limit", "data_type": "i16", "writable": true },
                { "type": "coil", "address": 3, "name": "relay", "writable": true },
                { "type": "discrete", "address": 1 }
            ]),
        )
    }

    async fn cycle(
        port: &mut MockPort,
        config: &DeviceConfig,
        format: Format,
        commands: Vec<Command>,
    ) -> Result<MockChannel, DeviceError> {
        let topics = TopicBuilder::new(&config.maintopic);
        let identity = DeviceIdentity::new();
        let mut channel = MockChannel::new();
        let mut ctx = CodecContext::new(&topics, &identity, config, format, commands);
        RegisterMap.cycle(port, &mut channel, &mut ctx).await?;
        Ok(channel)
    }

    #[tokio::test]
    async fn test_publishes_one_document() {
        let mut port = MockPort::new();
        port.set_input(ADDR, 0, &[461]);
        port.set_input(ADDR, 2, &[0x0010, 0x0001]);
        port.set_holding(ADDR, 10, &[(-3i16) as u16]);
        port.set_coil(ADDR, 3, true);

        let channel = cycle(&mut port, &meter(), Format::Json, vec![]).await.unwrap();

        let published = channel.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "meter/data");

        let document: DataDocument = decode(&published[0].payload, Format::Json).unwrap();
        assert_eq!(document.values["voltage"].as_f64(), Some(230.5));
        assert_eq!(document.values["energy"], FieldValue::Unsigned(65552));
        assert_eq!(document.values["limit"], FieldValue::Signed(-3));
        assert_eq!(document.values["relay"], FieldValue::Bool(true));
        assert_eq!(document.values["discrete1"], FieldValue::Bool(false));
    }

    #[tokio::test]
    async fn test_cbor_document() {
        let mut port = MockPort::new();
        port.set_input(ADDR, 0, &[100]);

        let channel = cycle(&mut port, &meter(), Format::Cbor, vec![]).await.unwrap();
        let published = channel.published();
        let document: DataDocument = decode(&published[0].payload, Format::Cbor).unwrap();
        assert_eq!(document.values["voltage"].as_f64(), Some(50.0));
    }

    #[tokio::test]
    async fn test_writable_registers_accept_commands() {
        let mut port = MockPort::new();
        let commands = vec![
            Command::new("limit", "-20"),
            Command::new("relay", "off"),
            Command::new("voltage", "1"),
            Command::new("unknown", "1"),
        ];
        port.set_coil(ADDR, 3, true);

        cycle(&mut port, &meter(), Format::Json, commands).await.unwrap();

        assert_eq!(port.holding(ADDR, 10), (-20i16) as u16);
        assert!(!port.coil(ADDR, 3));
        assert_eq!(port.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_no_registers_publishes_nothing() {
        let mut port = MockPort::new();
        let config = DeviceConfig::new(ADDR, "empty");

        let channel = cycle(&mut port, &config, Format::Json, vec![]).await.unwrap();
        assert!(channel.published().is_empty());
        assert!(port.calls().is_empty());
    }

    #[test]
    fn test_register_value_types() {
        let mut reg: RegisterConfig =
            serde_json::from_value(json!({ "type": "holding", "address": 0, "data_type": "f32" }))
                .unwrap();
        assert_eq!(
            register_value(&[0x42F6, 0xE979], &reg).and_then(|v| v.as_f64()).map(|v| v.round()),
            Some(123.0)
        );

        reg.data_type = DataType::U16;
        reg.offset = 1.0;
        assert_eq!(register_value(&[5], &reg), Some(FieldValue::Float(6.0)));
    }
}
