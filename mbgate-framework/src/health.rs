//! Gateway health monitoring.
//!
//! Bus workers report every device cycle here; the runner periodically
//! publishes a [`HealthSnapshot`] on `<maintopic>/health`. Each device key
//! is only ever written by the worker that owns the device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::status::DeviceStatus;

/// Gateway health metrics.
#[derive(Debug)]
pub struct GatewayHealth {
    gateway_name: String,
    start_time: Instant,
    devices_total: AtomicU64,
    polls_total: AtomicU64,
    errors_total: AtomicU64,
    devices: RwLock<HashMap<String, DeviceHealth>>,
}

/// Health of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHealth {
    pub status: DeviceStatus,
    /// Last successful poll (millis since epoch), 0 if never.
    pub last_seen: i64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Health snapshot for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub gateway: String,
    /// "healthy", "degraded" or "error".
    pub status: String,
    pub uptime_secs: u64,
    pub devices_total: u64,
    pub devices_online: u64,
    pub devices_offline: u64,
    pub polls_total: u64,
    pub errors_total: u64,
}

impl GatewayHealth {
    pub fn new(gateway_name: impl Into<String>) -> Self {
        Self {
            gateway_name: gateway_name.into(),
            start_time: Instant::now(),
            devices_total: AtomicU64::new(0),
            polls_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_devices_total(&self, count: u64) {
        self.devices_total.store(count, Ordering::SeqCst);
    }

    /// Record a completed poll cycle.
    pub fn record_online(&self, device: &str) {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let state = devices.entry(device.to_string()).or_default();
        state.status = DeviceStatus::Online;
        state.last_seen = chrono::Utc::now().timestamp_millis();
        state.consecutive_failures = 0;
        state.last_error = None;
        drop(devices);

        self.polls_total.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a failed cycle.
    pub fn record_offline(&self, device: &str, error: &str) {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let state = devices.entry(device.to_string()).or_default();
        state.status = DeviceStatus::Offline;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(error.to_string());
        drop(devices);

        self.errors_total.fetch_add(1, Ordering::SeqCst);
    }

    /// Health of a single device.
    pub fn device(&self, device: &str) -> Option<DeviceHealth> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .cloned()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        let online = devices
            .values()
            .filter(|d| d.status == DeviceStatus::Online)
            .count() as u64;
        let offline = devices
            .values()
            .filter(|d| d.status == DeviceStatus::Offline)
            .count() as u64;
        drop(devices);

        let status = if offline == 0 {
            "healthy"
        } else if online > 0 {
            "degraded"
        } else {
            "error"
        };

        HealthSnapshot {
            gateway: self.gateway_name.clone(),
            status: status.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            devices_total: self.devices_total.load(Ordering::SeqCst),
            devices_online: online,
            devices_offline: offline,
            polls_total: self.polls_total.load(Ordering::SeqCst),
            errors_total: self.errors_total.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_new() {
        let health = GatewayHealth::new("test");

        let snapshot = health.snapshot();
        assert_eq!(snapshot.gateway, "test");
        assert_eq!(snapshot.status, "healthy");
        assert_eq!(snapshot.devices_total, 0);
    }

    #[test]
    fn test_device_failure_and_recovery() {
        let health = GatewayHealth::new("test");
        health.set_devices_total(1);

        health.record_offline("0/5", "timeout");
        health.record_offline("0/5", "timeout");
        let device = health.device("0/5").unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
        assert_eq!(device.consecutive_failures, 2);
        assert_eq!(health.snapshot().status, "error");

        health.record_online("0/5");
        let device = health.device("0/5").unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.consecutive_failures, 0);
        assert!(device.last_error.is_none());
        assert!(device.last_seen > 0);
    }

    #[test]
    fn test_health_status() {
        let health = GatewayHealth::new("test");
        health.set_devices_total(2);

        health.record_online("d1");
        health.record_online("d2");
        assert_eq!(health.snapshot().status, "healthy");

        health.record_offline("d1", "error");
        let snapshot = health.snapshot();
        assert_eq!(snapshot.status, "degraded");
        assert_eq!(snapshot.devices_online, 1);
        assert_eq!(snapshot.devices_offline, 1);
        assert_eq!(snapshot.polls_total, 2);
        assert_eq!(snapshot.errors_total, 1);
    }
}
