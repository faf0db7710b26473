//! Device and gateway status reporting.

use serde::{Deserialize, Serialize};

use crate::channel::{MessageChannel, PublishOptions, Qos};
use crate::error::ChannelError;

/// Device availability as published on `<prefix>/status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// The last poll cycle completed.
    Online,
    /// The last cycle failed (transport error or unknown device).
    Offline,
    /// Never polled.
    #[default]
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway status document, published on `<maintopic>/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatus {
    /// Gateway name.
    pub gateway: String,
    pub version: String,
    /// Current status ("running", "offline").
    pub status: String,
    /// Additional metadata (bus and device counts).
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl GatewayStatus {
    /// Create a new status with "running" state.
    pub fn running(gateway: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            gateway: gateway.into(),
            version: version.into(),
            status: "running".to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Create a status with "offline" state.
    pub fn offline(gateway: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            gateway: gateway.into(),
            version: version.into(),
            status: "offline".to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Add metadata to the status.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Publish this status as a retained JSON document on `topic`.
    pub async fn publish(
        &self,
        channel: &mut dyn MessageChannel,
        topic: &str,
    ) -> Result<(), ChannelError> {
        let payload =
            serde_json::to_vec(self).map_err(|e| ChannelError::Serialization(e.to_string()))?;
        channel
            .publish(topic, &payload, PublishOptions::retained_if_changed(Qos::AtLeastOnce))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_status_strings() {
        assert_eq!(DeviceStatus::Online.to_string(), "online");
        assert_eq!(DeviceStatus::Offline.as_str(), "offline");
        assert_eq!(DeviceStatus::default(), DeviceStatus::Unknown);
    }

    #[test]
    fn test_status_with_metadata() {
        let status = GatewayStatus::running("mbgate", "0.1.0").with_metadata(serde_json::json!({
            "buses": 2,
            "devices": 7
        }));

        assert_eq!(status.status, "running");
        assert_eq!(status.metadata["devices"], 7);
    }

    #[test]
    fn test_status_serialization() {
        let status =
            GatewayStatus::offline("mbgate", "1.0.0").with_metadata(serde_json::json!({ "buses": 1 }));

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"gateway\":\"mbgate\""));
        assert!(json.contains("\"status\":\"offline\""));
        assert!(json.contains("\"buses\":1"));
    }
}
