//! Error types for the Modbus gateway.

use thiserror::Error;

use mbgate_framework::ChannelError;

/// Field-bus I/O failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Request timed out")]
    Timeout,

    /// The slave answered with a Modbus exception.
    #[error("Modbus exception: {0}")]
    Exception(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Response transaction id did not match the request.
    #[error("Response sequence mismatch: {0}")]
    SequenceMismatch(String),

    #[error("Not connected: {0}")]
    NotConnected(String),
}

impl TransportError {
    /// Whether the connection should be dropped and reopened before the
    /// next request. Exceptions are regular answers and keep the link.
    pub fn drops_connection(&self) -> bool {
        !matches!(self, TransportError::Exception(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Why a device's identity did not select a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownReason {
    Vendor,
    Product,
}

impl std::fmt::Display for UnknownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnknownReason::Vendor => f.write_str("unknown vendor"),
            UnknownReason::Product => f.write_str("unknown product for vendor"),
        }
    }
}

/// Failure of one device's cycle. All variants are recovered per device:
/// the worker publishes `offline` and backs off.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The device answered but did not report vendor and product.
    #[error("Device has not reported {missing} yet")]
    Unidentified { missing: &'static str },

    #[error("No codec for '{vendor}' / '{product}': {reason}")]
    UnknownDevice {
        vendor: String,
        product: String,
        reason: UnknownReason,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl DeviceError {
    pub fn codec(msg: impl Into<String>) -> Self {
        DeviceError::Codec(msg.into())
    }
}

/// Codec registry population errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("A different codec is already registered for '{vendor}' / '{product}'")]
    DuplicateCodec { vendor: String, product: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_keeps_connection() {
        assert!(!TransportError::Exception("IllegalDataAddress".into()).drops_connection());
        assert!(TransportError::Timeout.drops_connection());
        assert!(TransportError::SequenceMismatch("tid".into()).drops_connection());
    }

    #[test]
    fn test_unidentified_message() {
        let err = DeviceError::Unidentified { missing: "product" };
        assert_eq!(err.to_string(), "Device has not reported product yet");
    }

    #[test]
    fn test_unknown_device_message() {
        let err = DeviceError::UnknownDevice {
            vendor: "Acme".into(),
            product: "Gizmo".into(),
            reason: UnknownReason::Product,
        };
        assert_eq!(
            err.to_string(),
            "No codec for 'Acme' / 'Gizmo': unknown product for vendor"
        );
    }
}
