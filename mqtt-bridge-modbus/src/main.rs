//! Modbus to MQTT gateway.
//!
//! Polls the configured Modbus buses and bridges their devices to MQTT.

use std::sync::Arc;

use anyhow::{Context, Result};
use mbgate_framework::{GatewayArgs, GatewayConfig, GatewayRunner};

use mqtt_bridge_modbus::config::ModbusGatewayConfig;
use mqtt_bridge_modbus::{BusWorker, ModbusPort, builtin_registry};

#[tokio::main]
async fn main() -> Result<()> {
    let args = GatewayArgs::parse();

    let config = ModbusGatewayConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    let registry = Arc::new(builtin_registry().context("Failed to register built-in codecs")?);

    let mut runner = GatewayRunner::new_with_args("mqtt-bridge-modbus", config, Some(&args))?
        .with_status_publishing();

    tracing::info!(config = %args.config.display(), codecs = registry.len(), "Loaded configuration");

    let config = runner.config();
    let health = runner.health();
    health.set_devices_total(config.device_count() as u64);

    for (index, bus) in config.modbuses.iter().enumerate() {
        let connection = bus.connection()?;
        tracing::info!(
            bus = index,
            connection = %connection,
            devices = bus.devices.len(),
            "Starting bus worker"
        );

        let port = ModbusPort::new(connection, bus.timeout(), bus.ignore_sequence);
        let worker = BusWorker::new(
            index,
            Arc::new(bus.clone()),
            port,
            runner.connector(),
            registry.clone(),
        )
        .with_format(config.serialization)
        .with_health(health.clone());

        runner.spawn(worker.run());
    }

    runner.run().await?;
    Ok(())
}
