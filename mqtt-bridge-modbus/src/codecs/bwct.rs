//! Codecs for Bernd Walter Computer Technology devices.
//!
//! All values go out as bare `<prefix>/<field>` payloads with the device's
//! publish options; commands arrive as bare values on `<prefix>/<field>` or
//! inside `<prefix>/cmd`. 32-bit counters on these boards are low word
//! first.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use mbgate_framework::MessageChannel;

use super::fixed;
use crate::codec::{Codec, CodecContext, Command};
use crate::decode::{i32_low_first, u32_low_first};
use crate::error::{DeviceError, RegistryError};
use crate::port::FieldBus;
use crate::registry::CodecRegistry;

pub const VENDOR: &str = "Bernd Walter Computer Technology";

pub const TWIN_RELAY: &str = "Ethernet-MB RS485 / twin power relay / 4ch input / LDR / DS18B20";
pub const SHTC3: &str = "RS485-SHTC3";
pub const LASER_WEIGHT: &str = "RS485-Laserdistance-Weight";
pub const IO88: &str = "RS485-IO88";
pub const ADC_DAC: &str = "MB ADC DAC";
pub const RFID_DISPLAY: &str = "125kHz RFID Reader / Display";
pub const RFID_WRITER: &str = "125kHz RFID Reader / Writer-Beta";
pub const CHAMBERPUMP: &str = "RS485-Chamberpump";

/// Register all BWCT codecs. Both RFID readers share one codec.
pub fn register(registry: &mut CodecRegistry) -> Result<(), RegistryError> {
    registry.register(VENDOR, TWIN_RELAY, Arc::new(TwinRelay))?;
    registry.register(VENDOR, SHTC3, Arc::new(Shtc3))?;
    registry.register(VENDOR, LASER_WEIGHT, Arc::new(LaserWeight))?;
    registry.register(VENDOR, IO88, Arc::new(Io88))?;
    registry.register(VENDOR, ADC_DAC, Arc::new(AdcDac))?;

    let rfid: Arc<dyn Codec> = Arc::new(RfidReader);
    registry.register(VENDOR, RFID_DISPLAY, rfid.clone())?;
    registry.register(VENDOR, RFID_WRITER, rfid)?;

    registry.register(VENDOR, CHAMBERPUMP, Arc::new(Chamberpump))?;
    Ok(())
}

fn invalid_value(command: &Command) {
    tracing::warn!(field = %command.field, value = %command.value, "Ignoring invalid command value");
}

/// Ethernet relay board.
///
/// - discrete inputs 0..4: `input0`..`input3`
/// - input registers 0..4: 16-bit `counter0`..`counter3`
/// - input registers 4, 5: `ldr0`, `ldr1`
/// - input registers 6..14: 32-bit `counter4`..`counter7`, low word first
/// - optional `DS18B20: [{ register }]`: `temperatureN` = signed value / 16
/// - commands: `relais0`/`relais1` (coils 0/1),
///   `counter_autoreset4`..`counter_autoreset7` (coils 2..5)
pub struct TwinRelay;

#[derive(Debug, Deserialize)]
struct Ds18b20 {
    register: u16,
}

#[async_trait]
impl Codec for TwinRelay {
    fn name(&self) -> &str {
        "bwct-twin-relay"
    }

    async fn cycle(
        &self,
        port: &mut dyn FieldBus,
        channel: &mut dyn MessageChannel,
        ctx: &mut CodecContext<'_>,
    ) -> Result<(), DeviceError> {
        let address = ctx.address;

        let inputs: [bool; 4] = fixed(port.read_discrete_inputs(address, 0, 4).await?)?;
        for (i, input) in inputs.into_iter().enumerate() {
            ctx.publish(channel, &format!("input{}", i), input).await?;
        }

        let regs: [u16; 14] = fixed(port.read_input_registers(address, 0, 14).await?)?;
        for (i, counter) in regs[..4].iter().enumerate() {
            ctx.publish(channel, &format!("counter{}", i), *counter).await?;
        }
        ctx.publish(channel, "ldr0", regs[4]).await?;
        ctx.publish(channel, "ldr1", regs[5]).await?;
        for (i, pair) in regs[6..].chunks_exact(2).enumerate() {
            let counter = u32_low_first(pair[0], pair[1]);
            ctx.publish(channel, &format!("counter{}", i + 4), counter).await?;
        }

        let sensors: Vec<Ds18b20> = ctx.config.sub_config("DS18B20")?.unwrap_or_default();
        for (i, sensor) in sensors.iter().enumerate() {
            // A missing sensor must not cost the other values.
            match port.read_input_register(address, sensor.register).await {
                Ok(raw) => {
                    let celsius = f64::from(raw as i16) / 16.0;
                    ctx.publish(channel, &format!("temperature{}", i), celsius).await?;
                }
                Err(e) => {
                    tracing::debug!(
                        address,
                        register = sensor.register,
                        error = %e,
                        "DS18B20 read failed"
                    );
                }
            }
        }

        for command in ctx.take_commands() {
            let coil = match command.field.as_str() {
                "relais0" => 0,
                "relais1" => 1,
                _ => match command.index_of("counter_autoreset") {
                    Some(n @ 4..=7) => n - 2,
                    _ => continue,
                },
            };
            port.write_coil(address, coil, command.as_switch()).await?;
        }

        Ok(())
    }
}

/// Temperature/humidity sensor.
///
/// - input register 0: `temperature` (signed)
/// - input register 1: `humidity`
pub struct Shtc3;

#[async_trait]
impl Codec for Shtc3 {
    fn name(&self) -> &str {
        "bwct-shtc3"
    }

    async fn cycle(
        &self,
        port: &mut dyn FieldBus,
        channel: &mut dyn MessageChannel,
        ctx: &mut CodecContext<'_>,
    ) -> Result<(), DeviceError> {
        let [temperature, humidity]: [u16; 2] =
            fixed(port.read_input_registers(ctx.address, 0, 2).await?)?;
        ctx.publish(channel, "temperature", temperature as i16).await?;
        ctx.publish(channel, "humidity", humidity).await?;
        ctx.take_commands();
        Ok(())
    }
}

/// Laser distance and load cell board.
///
/// - input registers 0, 1: signed 32-bit `weight`, low word first
/// - input register 2: `distance`
pub struct LaserWeight;

#[async_trait]
impl Codec for LaserWeight {
    fn name(&self) -> &str {
        "bwct-laser-weight"
    }

    async fn cycle(
        &self,
        port: &mut dyn FieldBus,
        channel: &mut dyn MessageChannel,
        ctx: &mut CodecContext<'_>,
    ) -> Result<(), DeviceError> {
        let [low, high, distance]: [u16; 3] =
            fixed(port.read_input_registers(ctx.address, 0, 3).await?)?;
        ctx.publish(channel, "weight", i32_low_first(low, high)).await?;
        ctx.publish(channel, "distance", distance).await?;
        ctx.take_commands();
        Ok(())
    }
}

/// Eight inputs, eight outputs.
///
/// - discrete inputs 0..8: `input0`..`input7`
/// - commands: `output0`..`output7` (coils 0..8), `pwm0`..`pwm7`
///   (holding registers 0..8)
pub struct Io88;

#[async_trait]
impl Codec for Io88 {
    fn name(&self) -> &str {
        "bwct-io88"
    }

    async fn cycle(
        &self,
        port: &mut dyn FieldBus,
        channel: &mut dyn MessageChannel,
        ctx: &mut CodecContext<'_>,
    ) -> Result<(), DeviceError> {
        let address = ctx.address;

        let inputs: [bool; 8] = fixed(port.read_discrete_inputs(address, 0, 8).await?)?;
        for (i, input) in inputs.into_iter().enumerate() {
            ctx.publish(channel, &format!("input{}", i), input).await?;
        }

        for command in ctx.take_commands() {
            if let Some(r @ 0..=7) = command.index_of("output") {
                port.write_coil(address, r, command.as_switch()).await?;
            } else if let Some(r @ 0..=7) = command.index_of("pwm") {
                match command.as_u16() {
                    Some(value) => port.write_register(address, r, value).await?,
                    None => invalid_value(&command),
                }
            }
        }

        Ok(())
    }
}

/// Four channel ADC with two DAC outputs.
///
/// - input registers 0..4: `adc0`..`adc3`
/// - input register 9: `ref`
/// - commands: `dac0`/`dac1` (holding registers 0/1)
pub struct AdcDac;

#[async_trait]
impl Codec for AdcDac {
    fn name(&self) -> &str {
        "bwct-adc-dac"
    }

    async fn cycle(
        &self,
        port: &mut dyn FieldBus,
        channel: &mut dyn MessageChannel,
        ctx: &mut CodecContext<'_>,
    ) -> Result<(), DeviceError> {
        let address = ctx.address;

        let regs: [u16; 10] = fixed(port.read_input_registers(address, 0, 10).await?)?;
        for (i, adc) in regs[..4].iter().enumerate() {
            ctx.publish(channel, &format!("adc{}", i), *adc).await?;
        }
        ctx.publish(channel, "ref", regs[9]).await?;

        for command in ctx.take_commands() {
            let Some(r @ 0..=1) = command.index_of("dac") else {
                continue;
            };
            match command.as_u16() {
                Some(value) => port.write_register(address, r, value).await?,
                None => invalid_value(&command),
            }
        }

        Ok(())
    }
}

/// 125 kHz RFID readers (display and writer variants).
///
/// Input register 0 holds the key length, registers 1..=10 one key byte
/// each. A read key is published once on `key` as colon separated hex,
/// not retained and not change-suppressed so repeated swipes are seen.
pub struct RfidReader;

/// Key bytes the reader can report.
const RFID_MAX_KEY_LEN: usize = 10;

/// Render the key from the reader's register block.
pub fn rfid_key(regs: &[u16]) -> Option<String> {
    let (&len, bytes) = regs.split_first()?;
    let len = usize::from(len).min(RFID_MAX_KEY_LEN).min(bytes.len());
    if len == 0 {
        return None;
    }
    Some(
        bytes[..len]
            .iter()
            .map(|b| format!("{:02x}", b & 0xff))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

#[async_trait]
impl Codec for RfidReader {
    fn name(&self) -> &str {
        "bwct-rfid"
    }

    async fn cycle(
        &self,
        port: &mut dyn FieldBus,
        channel: &mut dyn MessageChannel,
        ctx: &mut CodecContext<'_>,
    ) -> Result<(), DeviceError> {
        let regs: [u16; 11] = fixed(port.read_input_registers(ctx.address, 0, 11).await?)?;
        if let Some(key) = rfid_key(&regs) {
            ctx.publish_event(channel, "key", key).await?;
        }
        ctx.take_commands();
        Ok(())
    }
}

/// Pump controller for a collection chamber.
///
/// - input registers 0..4: `adc0`..`adc3`
/// - input register 4: `state` (idle, filling, full, emptying, empty,
///   unknown)
/// - input registers 5..9: 32-bit `cyclecounter` and `cycletime`, low word
///   first
/// - commands: `triggerlevel_top`/`triggerlevel_bottom` (holding registers
///   0/1)
pub struct Chamberpump;

pub fn chamberpump_state(raw: u16) -> &'static str {
    match raw {
        0 => "idle",
        1 => "filling",
        2 => "full",
        3 => "emptying",
        4 => "empty",
        _ => "unknown",
    }
}

#[async_trait]
impl Codec for Chamberpump {
    fn name(&self) -> &str {
        "bwct-chamberpump"
    }

    async fn cycle(
        &self,
        port: &mut dyn FieldBus,
        channel: &mut dyn MessageChannel,
        ctx: &mut CodecContext<'_>,
    ) -> Result<(), DeviceError> {
        let address = ctx.address;

        let regs: [u16; 9] = fixed(port.read_input_registers(address, 0, 9).await?)?;
        for (i, adc) in regs[..4].iter().enumerate() {
            ctx.publish(channel, &format!("adc{}", i), *adc).await?;
        }
        ctx.publish(channel, "state", chamberpump_state(regs[4])).await?;
        ctx.publish(channel, "cyclecounter", u32_low_first(regs[5], regs[6]))
            .await?;
        ctx.publish(channel, "cycletime", u32_low_first(regs[7], regs[8]))
            .await?;

        for command in ctx.take_commands() {
            let register = match command.field.as_str() {
                "triggerlevel_top" => 0,
                "triggerlevel_bottom" => 1,
                _ => continue,
            };
            match command.as_u16() {
                Some(value) => port.write_register(address, register, value).await?,
                None => invalid_value(&command),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbgate_common::{Format, TopicBuilder};

    use crate::config::DeviceConfig;
    use crate::error::TransportError;
    use crate::identity::DeviceIdentity;
    use crate::mock::{MockChannel, MockPort, PortCall};

    const ADDR: u8 = 9;

    async fn cycle(
        codec: &dyn Codec,
        port: &mut MockPort,
        config: &DeviceConfig,
        commands: Vec<Command>,
    ) -> Result<MockChannel, DeviceError> {
        let topics = TopicBuilder::new(&config.maintopic);
        let identity = DeviceIdentity::new();
        let mut channel = MockChannel::new();
        let mut ctx = CodecContext::new(&topics, &identity, config, Format::Json, commands);
        codec.cycle(port, &mut channel, &mut ctx).await?;
        Ok(channel)
    }

    #[tokio::test]
    async fn test_twin_relay_values() {
        let mut port = MockPort::new();
        port.set_discrete(ADDR, 0, true);
        port.set_discrete(ADDR, 3, true);
        port.set_input(ADDR, 0, &[1, 2, 3, 4, 500, 600, 0x0001, 0x0002, 7, 0, 0, 0, 0xFFFF, 0xFFFF]);
        let config = DeviceConfig::new(ADDR, "relay");

        let channel = cycle(&TwinRelay, &mut port, &config, vec![]).await.unwrap();

        assert_eq!(channel.last_payload("relay/input0").as_deref(), Some("1"));
        assert_eq!(channel.last_payload("relay/input1").as_deref(), Some("0"));
        assert_eq!(channel.last_payload("relay/input3").as_deref(), Some("1"));
        assert_eq!(channel.last_payload("relay/counter3").as_deref(), Some("4"));
        assert_eq!(channel.last_payload("relay/ldr1").as_deref(), Some("600"));
        assert_eq!(channel.last_payload("relay/counter4").as_deref(), Some("131073"));
        assert_eq!(channel.last_payload("relay/counter5").as_deref(), Some("7"));
        assert_eq!(channel.last_payload("relay/counter7").as_deref(), Some("4294967295"));
    }

    #[tokio::test]
    async fn test_twin_relay_failed_sensor_keeps_others() {
        let mut port = MockPort::new();
        port.set_input(ADDR, 20, &[0x0158]); // 21.5 C
        port.set_input(ADDR, 21, &[0xFF5E]); // -10.125 C
        let config = DeviceConfig::new(ADDR, "relay").with_extra(
            "DS18B20",
            serde_json::json!([{ "register": 20 }, { "register": 21 }]),
        );

        let channel = cycle(&TwinRelay, &mut port, &config, vec![]).await.unwrap();
        assert_eq!(channel.last_payload("relay/temperature0").as_deref(), Some("21.5"));
        assert_eq!(channel.last_payload("relay/temperature1").as_deref(), Some("-10.125"));
    }

    #[tokio::test]
    async fn test_twin_relay_commands() {
        let mut port = MockPort::new();
        let config = DeviceConfig::new(ADDR, "relay");
        let commands = vec![
            Command::new("relais1", "1"),
            Command::new("counter_autoreset6", "on"),
            Command::new("counter_autoreset3", "1"),
            Command::new("input0", "1"),
        ];

        cycle(&TwinRelay, &mut port, &config, commands).await.unwrap();
        assert_eq!(
            port.writes(),
            vec![
                PortCall::WriteCoil {
                    address: ADDR,
                    index: 1,
                    value: true
                },
                PortCall::WriteCoil {
                    address: ADDR,
                    index: 4,
                    value: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let mut port = MockPort::new();
        port.fail(ADDR, TransportError::Timeout);
        let config = DeviceConfig::new(ADDR, "relay");

        let result = cycle(&Shtc3, &mut port, &config, vec![]).await;
        assert!(matches!(
            result,
            Err(DeviceError::Transport(TransportError::Timeout))
        ));
    }

    #[tokio::test]
    async fn test_shtc3_signed_temperature() {
        let mut port = MockPort::new();
        port.set_input(ADDR, 0, &[(-5i16) as u16, 48]);
        let config = DeviceConfig::new(ADDR, "climate");

        let channel = cycle(&Shtc3, &mut port, &config, vec![]).await.unwrap();
        assert_eq!(channel.last_payload("climate/temperature").as_deref(), Some("-5"));
        assert_eq!(channel.last_payload("climate/humidity").as_deref(), Some("48"));
    }

    #[tokio::test]
    async fn test_laser_weight() {
        let mut port = MockPort::new();
        port.set_input(ADDR, 0, &[0xFFFE, 0xFFFF, 1234]);
        let config = DeviceConfig::new(ADDR, "scale");

        let channel = cycle(&LaserWeight, &mut port, &config, vec![]).await.unwrap();
        assert_eq!(channel.last_payload("scale/weight").as_deref(), Some("-2"));
        assert_eq!(channel.last_payload("scale/distance").as_deref(), Some("1234"));
    }

    #[tokio::test]
    async fn test_io88_outputs_and_pwm() {
        let mut port = MockPort::new();
        port.set_discrete(ADDR, 7, true);
        let config = DeviceConfig::new(ADDR, "io");
        let commands = vec![
            Command::new("output2", "1"),
            Command::new("pwm7", "300"),
            Command::new("pwm8", "1"),
            Command::new("pwm1", "lots"),
        ];

        let channel = cycle(&Io88, &mut port, &config, commands).await.unwrap();
        assert_eq!(channel.last_payload("io/input7").as_deref(), Some("1"));
        assert!(port.coil(ADDR, 2));
        assert_eq!(port.holding(ADDR, 7), 300);
        assert_eq!(port.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_adc_dac() {
        let mut port = MockPort::new();
        port.set_input(ADDR, 0, &[10, 11, 12, 13, 0, 0, 0, 0, 0, 2500]);
        let config = DeviceConfig::new(ADDR, "adc");

        let channel = cycle(&AdcDac, &mut port, &config, vec![Command::new("dac1", "4095")])
            .await
            .unwrap();
        assert_eq!(channel.last_payload("adc/adc3").as_deref(), Some("13"));
        assert_eq!(channel.last_payload("adc/ref").as_deref(), Some("2500"));
        assert_eq!(port.holding(ADDR, 1), 4095);
    }

    #[test]
    fn test_rfid_key() {
        assert_eq!(rfid_key(&[0, 0x12, 0x34]), None);
        assert_eq!(
            rfid_key(&[3, 0x0a, 0x1b, 0x1ff]).as_deref(),
            Some("0a:1b:ff")
        );
        // Length beyond the block is clamped.
        assert_eq!(rfid_key(&[40, 0x01]).as_deref(), Some("01"));
    }

    #[tokio::test]
    async fn test_rfid_swipes_are_events() {
        let mut port = MockPort::new();
        port.set_input(ADDR, 0, &[2, 0xde, 0xad]);
        let config = DeviceConfig::new(ADDR, "door");

        let topics = TopicBuilder::new("door");
        let identity = DeviceIdentity::new();
        let mut channel = MockChannel::new();
        for _ in 0..2 {
            let mut ctx = CodecContext::new(&topics, &identity, &config, Format::Json, vec![]);
            RfidReader.cycle(&mut port, &mut channel, &mut ctx).await.unwrap();
        }

        let keys: Vec<_> = channel
            .published()
            .into_iter()
            .filter(|p| p.topic == "door/key")
            .collect();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].payload_str(), "de:ad");
        assert!(!keys[0].options.persistent);
    }

    #[tokio::test]
    async fn test_chamberpump() {
        let mut port = MockPort::new();
        port.set_input(ADDR, 0, &[1, 2, 3, 4, 3, 10, 1, 60, 0]);
        let config = DeviceConfig::new(ADDR, "pump");

        let channel = cycle(
            &Chamberpump,
            &mut port,
            &config,
            vec![Command::new("triggerlevel_top", "800")],
        )
        .await
        .unwrap();
        assert_eq!(channel.last_payload("pump/state").as_deref(), Some("emptying"));
        assert_eq!(channel.last_payload("pump/cyclecounter").as_deref(), Some("65546"));
        assert_eq!(channel.last_payload("pump/cycletime").as_deref(), Some("60"));
        assert_eq!(port.holding(ADDR, 0), 800);
        assert_eq!(chamberpump_state(5), "unknown");
        assert_eq!(chamberpump_state(99), "unknown");
    }
}
