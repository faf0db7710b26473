//! Configuration for the Modbus gateway.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use mbgate_common::{Format, LoggingConfig, MqttConfig, port_from_number_or_string};
use mbgate_framework::{GatewayConfig, GatewayError, PublishOptions, Qos};

use crate::error::DeviceError;

/// Device configuration key of the generic register map.
pub const REGISTERS_KEY: &str = "registers";

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusGatewayConfig {
    /// Broker connection and gateway topic
    pub mqtt: MqttConfig,

    /// Field buses to poll
    pub modbuses: Vec<BusConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Encoding of structured `<prefix>/data` documents
    #[serde(default)]
    pub serialization: Format,

    /// Seconds between gateway health snapshots (0 disables)
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

fn default_health_interval() -> u64 {
    60
}

impl ModbusGatewayConfig {
    /// Number of configured devices across all buses.
    pub fn device_count(&self) -> usize {
        self.modbuses.iter().map(|bus| bus.devices.len()).sum()
    }
}

impl GatewayConfig for ModbusGatewayConfig {
    fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn health_interval(&self) -> Option<Duration> {
        (self.health_interval_secs > 0).then(|| Duration::from_secs(self.health_interval_secs))
    }

    fn status_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "buses": self.modbuses.len(),
            "devices": self.device_count(),
        })
    }

    fn validate(&self) -> Result<(), GatewayError> {
        mbgate_common::validate_prefix(&self.mqtt.maintopic)
            .map_err(|e| GatewayError::validation(format!("mqtt.maintopic: {}", e)))?;

        if self.modbuses.is_empty() {
            return Err(GatewayError::validation(
                "At least one bus must be configured in 'modbuses'",
            ));
        }

        for (bus, config) in self.modbuses.iter().enumerate() {
            config.validate(bus)?;
        }

        Ok(())
    }
}

/// One field bus: a Modbus TCP endpoint or a serial RTU line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// TCP host (IP or hostname)
    #[serde(default)]
    pub host: Option<String>,

    /// TCP port, as number or numeric string (default: 502)
    #[serde(
        default = "default_modbus_port",
        deserialize_with = "port_from_number_or_string"
    )]
    pub port: u16,

    /// Serial device path for RTU (e.g. "/dev/ttyU0")
    #[serde(default)]
    pub serial: Option<String>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    #[serde(default)]
    pub parity: Parity,

    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Retry once on a fresh connection after a transaction id mismatch
    #[serde(default)]
    pub ignore_sequence: bool,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Devices in polling order; the position is the device slot
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Serial parity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Resolved transport of a bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp { host: String, port: u16 },
    /// Modbus RTU (serial) connection
    Rtu {
        path: String,
        baud_rate: u32,
        data_bits: u8,
        parity: Parity,
        stop_bits: u8,
    },
}

impl std::fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionConfig::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            ConnectionConfig::Rtu {
                path, baud_rate, ..
            } => write!(f, "rtu://{}@{}", path, baud_rate),
        }
    }
}

impl BusConfig {
    /// The transport this bus uses. Exactly one of `host` and `serial`
    /// must be set.
    pub fn connection(&self) -> Result<ConnectionConfig, GatewayError> {
        match (&self.host, &self.serial) {
            (Some(host), None) => Ok(ConnectionConfig::Tcp {
                host: host.clone(),
                port: self.port,
            }),
            (None, Some(path)) => Ok(ConnectionConfig::Rtu {
                path: path.clone(),
                baud_rate: self.baud_rate,
                data_bits: self.data_bits,
                parity: self.parity,
                stop_bits: self.stop_bits,
            }),
            (Some(_), Some(_)) => Err(GatewayError::validation(
                "bus must not set both 'host' and 'serial'",
            )),
            (None, None) => Err(GatewayError::validation(
                "bus needs either 'host' (TCP) or 'serial' (RTU)",
            )),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self, bus: usize) -> Result<(), GatewayError> {
        self.connection()
            .map_err(|e| GatewayError::validation(format!("modbuses[{}]: {}", bus, e)))?;

        if self.timeout_ms == 0 {
            return Err(GatewayError::validation(format!(
                "modbuses[{}]: timeout_ms must be positive",
                bus
            )));
        }

        for (slot, device) in self.devices.iter().enumerate() {
            device.validate().map_err(|msg| {
                GatewayError::validation(format!("modbuses[{}].devices[{}]: {}", bus, slot, msg))
            })?;
        }

        Ok(())
    }
}

/// Configuration of a single device on a bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Modbus unit address
    pub address: u8,

    /// Topic prefix of the device
    pub maintopic: String,

    /// Static identity overrides; a set field is never queried
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub version: Option<String>,

    /// Minimum seconds between polls
    #[serde(default = "default_poll_interval")]
    pub min_pollintervall: f64,

    #[serde(default)]
    pub qos: Qos,

    /// Retain published values
    #[serde(default = "default_true")]
    pub persistent: bool,

    /// Only publish values that changed
    #[serde(default = "default_true")]
    pub unchanged: bool,

    /// Codec specific settings, handed to the codec as-is
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_poll_interval() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl DeviceConfig {
    /// Minimal configuration, mostly for tests and programmatic setups.
    pub fn new(address: u8, maintopic: impl Into<String>) -> Self {
        Self {
            address,
            maintopic: maintopic.into(),
            vendor: None,
            product: None,
            version: None,
            min_pollintervall: default_poll_interval(),
            qos: Qos::default(),
            persistent: true,
            unchanged: true,
            extra: serde_json::Map::new(),
        }
    }

    /// Builder-style static identity.
    pub fn with_identity(mut self, vendor: &str, product: &str, version: Option<&str>) -> Self {
        self.vendor = Some(vendor.to_string());
        self.product = Some(product.to_string());
        self.version = version.map(str::to_string);
        self
    }

    pub fn with_poll_interval(mut self, secs: f64) -> Self {
        self.min_pollintervall = secs;
        self
    }

    pub fn with_extra(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// Minimum poll interval as a duration.
    pub fn min_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.min_pollintervall)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_poll_interval()))
    }

    /// Publish options for this device's regular values.
    pub fn publish_options(&self) -> PublishOptions {
        PublishOptions {
            persistent: self.persistent,
            only_if_changed: self.unchanged,
            qos: self.qos,
        }
    }

    /// Deserialize a codec specific setting. `Ok(None)` if the key is absent.
    pub fn sub_config<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, DeviceError> {
        self.extra
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|e| DeviceError::codec(format!("invalid '{}' setting: {}", key, e)))
            })
            .transpose()
    }

    fn validate(&self) -> Result<(), String> {
        mbgate_common::validate_prefix(&self.maintopic)
            .map_err(|e| format!("maintopic: {}", e))?;

        if !self.min_pollintervall.is_finite() || self.min_pollintervall < 0.0 {
            return Err(format!(
                "min_pollintervall must be a non-negative number, got {}",
                self.min_pollintervall
            ));
        }

        if self.extra.contains_key(REGISTERS_KEY) {
            self.sub_config::<Vec<RegisterConfig>>(REGISTERS_KEY)
                .map_err(|e| e.to_string())?;
        }

        Ok(())
    }
}

/// One entry of a generic register map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    /// Register type
    #[serde(rename = "type")]
    pub register_type: RegisterType,

    /// Register address (0-based)
    pub address: u16,

    /// Field name in the data document (default: `<type><address>`)
    #[serde(default)]
    pub name: Option<String>,

    /// Data type interpretation for holding/input registers
    #[serde(default)]
    pub data_type: DataType,

    /// Scaling factor (value * scale)
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Offset (value * scale + offset)
    #[serde(default)]
    pub offset: f64,

    /// Accept write commands for this field (coils and holding registers)
    #[serde(default)]
    pub writable: bool,
}

fn default_scale() -> f64 {
    1.0
}

impl RegisterConfig {
    /// Field name in published documents and command topics.
    pub fn field_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}{}", self.register_type.as_str(), self.address),
        }
    }
}

/// Modbus register types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    /// Discrete output coils (read/write, 1-bit)
    Coil,
    /// Discrete input contacts (read-only, 1-bit)
    Discrete,
    /// Input registers (read-only, 16-bit)
    Input,
    /// Holding registers (read/write, 16-bit)
    Holding,
}

impl RegisterType {
    /// Return the string name for this register type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
            RegisterType::Input => "input",
            RegisterType::Holding => "holding",
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Holding)
    }
}

/// Data type interpretation for 16-bit registers.
///
/// Plain 32-bit types take the first register as the high word; the `Le`
/// variants take it as the low word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 16-bit integer (default)
    #[default]
    U16,
    /// Signed 16-bit integer
    I16,
    /// Unsigned 32-bit integer, high word first
    U32,
    /// Signed 32-bit integer, high word first
    I32,
    /// 32-bit float, high word first
    F32,
    /// Unsigned 32-bit integer, low word first
    U32Le,
    /// Signed 32-bit integer, low word first
    I32Le,
    /// 32-bit float, low word first
    F32Le,
}

impl DataType {
    /// Number of 16-bit registers one value occupies.
    pub fn registers(&self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 => 1,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MQTT: &str = r#"mqtt: { id: "gw", host: "broker", maintopic: "gw" }"#;

    fn parse(body: &str) -> Result<ModbusGatewayConfig, GatewayError> {
        ModbusGatewayConfig::parse(&format!("{{ {}, {} }}", MQTT, body))
    }

    #[test]
    fn test_parse_tcp_bus() {
        let config = parse(
            r#"modbuses: [
                {
                    host: "10.0.0.5",
                    port: "1502",
                    ignore_sequence: true,
                    devices: [
                        { address: 5, maintopic: "home/relay", qos: 1, unchanged: false }
                    ]
                }
            ]"#,
        )
        .unwrap();

        let bus = &config.modbuses[0];
        assert_eq!(
            bus.connection().unwrap(),
            ConnectionConfig::Tcp {
                host: "10.0.0.5".to_string(),
                port: 1502
            }
        );
        assert!(bus.ignore_sequence);
        assert_eq!(bus.timeout(), Duration::from_millis(1000));

        let device = &bus.devices[0];
        assert_eq!(device.address, 5);
        assert_eq!(device.qos, Qos::AtLeastOnce);
        assert!(device.persistent);
        assert!(!device.unchanged);
        assert_eq!(device.min_interval(), Duration::from_secs(1));
        assert!(device.extra.is_empty());
    }

    #[test]
    fn test_parse_rtu_bus() {
        let config = parse(
            r#"modbuses: [
                { serial: "/dev/ttyU0", baud_rate: 19200, parity: "even", devices: [] }
            ]"#,
        )
        .unwrap();

        match config.modbuses[0].connection().unwrap() {
            ConnectionConfig::Rtu {
                path,
                baud_rate,
                parity,
                ..
            } => {
                assert_eq!(path, "/dev/ttyU0");
                assert_eq!(baud_rate, 19200);
                assert_eq!(parity, Parity::Even);
            }
            other => panic!("Expected RTU connection, got {:?}", other),
        }
    }

    #[test]
    fn test_codec_settings_kept_in_extra() {
        let config = parse(
            r#"modbuses: [
                {
                    host: "10.0.0.5",
                    devices: [
                        {
                            address: 1,
                            maintopic: "cellar",
                            min_pollintervall: 10,
                            DS18B20: [ { register: 20 }, { register: 21 } ]
                        }
                    ]
                }
            ]"#,
        )
        .unwrap();

        let device = &config.modbuses[0].devices[0];
        assert_eq!(device.min_interval(), Duration::from_secs(10));
        assert_eq!(device.extra["DS18B20"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_missing_modbuses_rejected() {
        let result = ModbusGatewayConfig::parse(&format!("{{ {} }}", MQTT));
        assert!(matches!(result, Err(GatewayError::ConfigParse(_))));
    }

    #[test]
    fn test_bus_needs_exactly_one_transport() {
        let neither = parse(r#"modbuses: [ { devices: [] } ]"#);
        assert!(matches!(neither, Err(GatewayError::ConfigValidation(_))));

        let both = parse(r#"modbuses: [ { host: "h", serial: "/dev/ttyU0" } ]"#);
        assert!(matches!(both, Err(GatewayError::ConfigValidation(_))));
    }

    #[test]
    fn test_device_validation() {
        let empty_topic =
            parse(r#"modbuses: [ { host: "h", devices: [ { address: 1, maintopic: "" } ] } ]"#);
        assert!(matches!(empty_topic, Err(GatewayError::ConfigValidation(_))));

        let negative = parse(
            r#"modbuses: [ { host: "h", devices: [
                { address: 1, maintopic: "a", min_pollintervall: -1 } ] } ]"#,
        );
        assert!(matches!(negative, Err(GatewayError::ConfigValidation(_))));

        let bad_qos =
            parse(r#"modbuses: [ { host: "h", devices: [ { address: 1, maintopic: "a", qos: 3 } ] } ]"#);
        assert!(bad_qos.is_err());

        let bad_registers = parse(
            r#"modbuses: [ { host: "h", devices: [
                { address: 1, maintopic: "a", registers: [ { type: "bogus", address: 0 } ] } ] } ]"#,
        );
        assert!(matches!(bad_registers, Err(GatewayError::ConfigValidation(_))));
    }

    #[test]
    fn test_zero_poll_interval() {
        let device = DeviceConfig::new(1, "a").with_poll_interval(0.0);
        assert_eq!(device.min_interval(), Duration::ZERO);
    }

    #[test]
    fn test_register_defaults() {
        let reg: RegisterConfig =
            serde_json::from_value(serde_json::json!({ "type": "holding", "address": 7 }))
                .unwrap();
        assert_eq!(reg.data_type, DataType::U16);
        assert_eq!(reg.scale, 1.0);
        assert!(!reg.writable);
        assert_eq!(reg.field_name(), "holding7");
        assert_eq!(DataType::F32Le.registers(), 2);
    }

    #[test]
    fn test_health_interval() {
        let config = parse(r#"modbuses: [ { host: "h" } ], health_interval_secs: 0"#).unwrap();
        assert_eq!(config.health_interval(), None);
    }
}
