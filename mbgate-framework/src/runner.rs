//! Gateway runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;

use mbgate_common::{LoggingConfig, TopicBuilder, init_tracing};

use crate::GatewayArgs;
use crate::channel::{MessageChannel, PublishOptions, Qos};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::health::GatewayHealth;
use crate::mqtt::{MqttChannel, MqttConnector};
use crate::pidfile::PidFile;
use crate::status::GatewayStatus;

/// Gateway runner that manages the lifecycle of the process.
///
/// Handles:
/// - Logging initialization
/// - PID file creation and removal
/// - Task spawning and management
/// - Gateway status and periodic health publishing
/// - Shutdown on Ctrl+C / SIGTERM
///
/// # Example
///
/// ```ignore
/// use mbgate_framework::{GatewayArgs, GatewayConfig, GatewayRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = GatewayArgs::parse();
///     let config = MyGatewayConfig::load(&args.config)?;
///
///     let mut runner = GatewayRunner::new_with_args("mygateway", config, Some(&args))?
///         .with_status_publishing();
///
///     let connector = runner.connector();
///     runner.spawn(async move {
///         // Worker logic here
///     });
///
///     runner.run().await
/// }
/// ```
pub struct GatewayRunner<C: GatewayConfig> {
    name: String,
    version: String,
    config: Arc<C>,
    connector: MqttConnector,
    health: Arc<GatewayHealth>,
    status_channel: Option<MqttChannel>,
    pidfile: Option<PidFile>,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: GatewayConfig> GatewayRunner<C> {
    /// Create a new runner without CLI overrides.
    pub fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None)
    }

    /// Create a new runner with CLI args for log level and PID file.
    ///
    /// This will:
    /// 1. Initialize logging based on config (with optional CLI override)
    /// 2. Write the PID file, if requested
    /// 3. Prepare the MQTT connector used for device channels
    pub fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&GatewayArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = match args.and_then(GatewayArgs::log_level_override) {
            Some(level) => LoggingConfig {
                level,
                format: config.logging().format,
            },
            None => config.logging().clone(),
        };
        init_tracing(&log_config).map_err(|e| GatewayError::config(e.to_string()))?;

        tracing::info!(gateway = %name, version = %version, "Starting gateway");

        let pidfile = args
            .and_then(|a| a.pidfile.as_ref())
            .map(PidFile::create)
            .transpose()?;

        let connector = MqttConnector::new(config.mqtt().clone());

        Ok(Self {
            health: Arc::new(GatewayHealth::new(&name)),
            name,
            version,
            config: Arc::new(config),
            connector,
            status_channel: None,
            pidfile,
            tasks: Vec::new(),
        })
    }

    /// Enable gateway status and health publishing on `<maintopic>`.
    ///
    /// The status channel's last will marks the gateway offline if the
    /// process dies without shutting down.
    pub fn with_status_publishing(mut self) -> Self {
        let mqtt = self.config.mqtt();
        let topics = TopicBuilder::new(&mqtt.maintopic);
        let will = GatewayStatus::offline(&self.name, &self.version);
        let will_payload = serde_json::to_vec(&will).unwrap_or_else(|_| b"offline".to_vec());

        self.status_channel = Some(self.connector.open(
            &format!("{}-gateway", mqtt.id),
            &topics.status(),
            &will_payload,
            Qos::AtLeastOnce,
        ));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Shared handle to the configuration.
    pub fn config(&self) -> Arc<C> {
        self.config.clone()
    }

    /// Connector for device channels.
    pub fn connector(&self) -> MqttConnector {
        self.connector.clone()
    }

    /// Shared health tracker.
    pub fn health(&self) -> Arc<GatewayHealth> {
        self.health.clone()
    }

    /// Spawn a worker task.
    ///
    /// The task will be tracked and aborted on shutdown.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(future));
    }

    /// Run the gateway until a shutdown signal is received.
    ///
    /// This will:
    /// 1. Publish "running" status (if enabled)
    /// 2. Publish health snapshots at the configured interval
    /// 3. Wait for Ctrl+C or SIGTERM
    /// 4. Abort all spawned tasks
    /// 5. Publish "offline" status (if enabled) and remove the PID file
    pub async fn run(mut self) -> Result<()> {
        let topics = TopicBuilder::new(&self.config.mqtt().maintopic);

        if let Some(channel) = self.status_channel.as_mut() {
            let status = GatewayStatus::running(&self.name, &self.version)
                .with_metadata(self.config.status_metadata());
            if let Err(e) = status.publish(channel, &topics.status()).await {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        }

        tracing::info!(
            gateway = %self.name,
            tasks = self.tasks.len(),
            "Gateway running. Press Ctrl+C to stop."
        );

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        match self.config.health_interval() {
            Some(period) if self.status_channel.is_some() => {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = ticker.tick() => self.publish_health(&topics).await,
                    }
                }
            }
            _ => shutdown.await,
        }

        tracing::info!(gateway = %self.name, "Received shutdown signal");

        for task in &self.tasks {
            task.abort();
        }

        if let Some(channel) = self.status_channel.as_mut() {
            let status = GatewayStatus::offline(&self.name, &self.version);
            if let Err(e) = status.publish(channel, &topics.status()).await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
            // Let the event loop flush the last publication.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        drop(self.pidfile.take());
        tracing::info!(gateway = %self.name, "Goodbye!");

        Ok(())
    }

    async fn publish_health(&mut self, topics: &TopicBuilder) {
        let Some(channel) = self.status_channel.as_mut() else {
            return;
        };

        let snapshot = self.health.snapshot();
        let payload = match serde_json::to_vec(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode health snapshot");
                return;
            }
        };

        if let Err(e) = channel
            .publish(&topics.health(), &payload, PublishOptions::event(Qos::AtMostOnce))
            .await
        {
            tracing::warn!(error = %e, "Failed to publish health snapshot");
        }
    }
}

/// Resolve on Ctrl+C, or on SIGTERM where available.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
