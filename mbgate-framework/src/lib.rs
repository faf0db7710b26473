//! mbgate Gateway Framework
//!
//! Common plumbing for gateways that republish field devices on MQTT.
//!
//! # Overview
//!
//! This framework provides:
//! - [`GatewayConfig`] trait for configuration loading and validation
//! - [`GatewayRunner`] for managing gateway lifecycle (startup, shutdown, signal handling)
//! - [`MessageChannel`] / [`ChannelConnector`] for per-device broker sessions,
//!   with [`MqttConnector`] as the `rumqttc` implementation
//! - [`GatewayArgs`] for common CLI argument parsing
//! - [`GatewayStatus`] and [`GatewayHealth`] for status reporting
//!
//! # Example
//!
//! ```ignore
//! use mbgate_framework::{GatewayArgs, GatewayConfig, GatewayRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = GatewayArgs::parse();
//!     let config = MyGatewayConfig::load(&args.config)?;
//!
//!     let mut runner = GatewayRunner::new_with_args("mygateway", config, Some(&args))?;
//!
//!     // Spawn protocol-specific workers
//!     let connector = runner.connector();
//!     runner.spawn(my_worker(connector));
//!
//!     // Run until Ctrl+C
//!     runner.run().await?;
//!     Ok(())
//! }
//! ```

mod args;
mod channel;
mod config;
mod error;
mod health;
mod mqtt;
mod pidfile;
mod runner;
mod status;

pub use args::{DEFAULT_CONFIG, GatewayArgs};
pub use channel::{
    ChangeTracker, ChannelConnector, ChannelRequest, MessageChannel, PublishOptions, Qos,
    ReceivedMessage,
};
pub use config::GatewayConfig;
pub use error::{ChannelError, GatewayError, Result};
pub use health::{DeviceHealth, GatewayHealth, HealthSnapshot};
pub use mqtt::{INBOUND_CAPACITY, MqttChannel, MqttConnector, topic_matches};
pub use pidfile::PidFile;
pub use runner::GatewayRunner;
pub use status::{DeviceStatus, GatewayStatus};

// Re-export commonly used types from mbgate-common
pub use mbgate_common::{
    DataDocument, FieldValue, Format, LoggingConfig, MqttConfig, TopicBuilder,
};
