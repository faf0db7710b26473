//! Configuration traits and utilities.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::{GatewayError, Result};
use crate::{LoggingConfig, MqttConfig};

/// Trait for gateway configuration types.
///
/// Implement this for a gateway's configuration struct to get loading,
/// validation and access to the common sections.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use mbgate_framework::{GatewayConfig, LoggingConfig, MqttConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyGatewayConfig {
///     pub mqtt: MqttConfig,
///     #[serde(default)]
///     pub logging: LoggingConfig,
///     pub buses: Vec<MyBusConfig>,
/// }
///
/// impl GatewayConfig for MyGatewayConfig {
///     fn mqtt(&self) -> &MqttConfig {
///         &self.mqtt
///     }
///
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
/// }
/// ```
pub trait GatewayConfig: Sized + DeserializeOwned {
    /// Broker settings.
    fn mqtt(&self) -> &MqttConfig;

    /// Logging settings.
    fn logging(&self) -> &LoggingConfig;

    /// How often the runner publishes a health snapshot. `None` disables it.
    fn health_interval(&self) -> Option<Duration> {
        None
    }

    /// Metadata attached to the gateway status document.
    fn status_metadata(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        mbgate_common::validate_prefix(&self.mqtt().maintopic)
            .map_err(|e| GatewayError::validation(format!("mqtt.maintopic: {}", e)))
    }

    /// Load configuration from a file path.
    ///
    /// Accepts JSON and JSON5. Calls [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(GatewayError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    fn parse(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        mqtt: MqttConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    impl GatewayConfig for TestConfig {
        fn mqtt(&self) -> &MqttConfig {
            &self.mqtt
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }
    }

    #[test]
    fn test_config_not_found() {
        let result = TestConfig::load("/nonexistent/path.json5");
        assert!(matches!(result, Err(GatewayError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_missing_mqtt_is_parse_error() {
        let result = TestConfig::parse("{ logging: { level: \"info\" } }");
        assert!(matches!(result, Err(GatewayError::ConfigParse(_))));
    }

    #[test]
    fn test_wildcard_maintopic_rejected() {
        let result =
            TestConfig::parse(r#"{ mqtt: { id: "gw", host: "h", maintopic: "gw/#" } }"#);
        assert!(matches!(result, Err(GatewayError::ConfigValidation(_))));
    }
}
