use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::serialization::Format;

/// Broker connection settings shared by every device channel.
///
/// Device channels derive their client id from `id` (see
/// [`MqttConfig::client_id`]) so that each bus/device pair holds its own
/// broker session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Base client identifier.
    pub id: String,

    /// Broker host name or address.
    pub host: String,

    /// Broker TCP port.
    #[serde(default = "default_mqtt_port", deserialize_with = "port_from_number_or_string")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Topic prefix for gateway-level status and health.
    pub maintopic: String,

    /// MQTT keep-alive in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

impl MqttConfig {
    /// Client id for the channel of device `slot` on bus `bus`.
    pub fn client_id(&self, bus: usize, slot: usize) -> String {
        format!("{}-{}-{}", self.id, bus, slot)
    }

    /// Whether broker credentials are configured.
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Accept a TCP port written either as a JSON number or as a numeric string.
pub fn port_from_number_or_string<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse::<u16>()
            .map_err(|e| serde::de::Error::custom(format!("invalid port '{}': {}", text, e))),
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Configuration sections every gateway binary understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseConfig {
    /// Broker settings. Required.
    pub mqtt: MqttConfig,

    /// Encoding for structured `data` documents.
    #[serde(default)]
    pub serialization: Format,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_base_config() {
        let json5 = r#"
        {
            mqtt: {
                id: "gw",
                host: "broker.local",
                port: 1884,
                username: "user",
                password: "secret",
                maintopic: "home/gw",
            },
            serialization: "cbor",
            logging: {
                level: "debug",
            },
        }
        "#;

        let config: BaseConfig = parse_config(json5).unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1884);
        assert!(config.mqtt.has_credentials());
        assert_eq!(config.serialization, Format::Cbor);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_port_as_string() {
        let json5 = r#"{ id: "gw", host: "h", port: "1883", maintopic: "t" }"#;
        let config: MqttConfig = parse_config(json5).unwrap();
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive_secs, 30);
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_port_invalid_string() {
        let json5 = r#"{ id: "gw", host: "h", port: "mqtt", maintopic: "t" }"#;
        assert!(parse_config::<MqttConfig>(json5).is_err());
    }

    #[test]
    fn test_missing_mqtt_section() {
        let result: Result<BaseConfig> = parse_config("{}");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_client_id_is_scoped() {
        let config: MqttConfig =
            parse_config(r#"{ id: "gw", host: "h", maintopic: "t" }"#).unwrap();
        assert_eq!(config.client_id(0, 3), "gw-0-3");
        assert_ne!(config.client_id(1, 0), config.client_id(0, 1));
    }

    #[test]
    fn test_json_logging_format() {
        let json5 = r#"
        {
            mqtt: { id: "gw", host: "h", maintopic: "t" },
            logging: {
                level: "debug",
                format: "json",
            },
        }
        "#;

        let config: BaseConfig = parse_config(json5).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }
}
