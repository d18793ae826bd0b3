// src/io/error.rs
//
// Error type shared by every transport and by the device manager.
// Protocol outcomes (timeouts, short payloads) are NOT errors: they travel
// as a `ResultCode` on the command response. `IoError` is reserved for
// transport failures and caller contract violations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    /// Opening or talking to the underlying device failed
    #[error("{device}: connection failed: {message}")]
    Connection { device: String, message: String },

    /// The serial port is held exclusively by another process
    #[error("{port}: port is in use by another process")]
    PortBusy { port: String },

    /// An operation did not complete in time
    #[error("{device}: {operation} timed out")]
    Timeout { device: String, operation: String },

    /// Malformed or unexpected bytes on the wire
    #[error("{protocol}: {message}")]
    Protocol { protocol: String, message: String },

    /// Invalid configuration (bad line settings, missing port, ...)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Caller passed something the operation cannot accept
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}: not connected")]
    NotConnected(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Failure reported by the BLE stack
    #[error("ble: {0}")]
    Ble(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IoError {
    pub fn connection(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Connection {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn port_busy(port: impl Into<String>) -> Self {
        IoError::PortBusy { port: port.into() }
    }

    pub fn timeout(device: impl Into<String>, operation: impl Into<String>) -> Self {
        IoError::Timeout {
            device: device.into(),
            operation: operation.into(),
        }
    }

    pub fn protocol(protocol: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Protocol {
            protocol: protocol.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        IoError::Configuration(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        IoError::InvalidArgument(message.into())
    }

    pub fn ble(message: impl std::fmt::Display) -> Self {
        IoError::Ble(message.to_string())
    }

    /// True for failures that only concern one port/device and should be
    /// skipped by a discovery loop rather than abort it.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            IoError::Connection { .. }
                | IoError::PortBusy { .. }
                | IoError::Timeout { .. }
                | IoError::NotConnected(_)
                | IoError::Io(_)
        )
    }
}

impl From<btleplug::Error> for IoError {
    fn from(e: btleplug::Error) -> Self {
        IoError::Ble(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = IoError::connection("uart(/dev/ttyUSB0)", "no such file");
        assert_eq!(e.to_string(), "uart(/dev/ttyUSB0): connection failed: no such file");

        let e = IoError::port_busy("COM3");
        assert_eq!(e.to_string(), "COM3: port is in use by another process");

        let e = IoError::protocol("ee31", "bad crc");
        assert_eq!(e.to_string(), "ee31: bad crc");
    }

    #[test]
    fn test_local_classification() {
        assert!(IoError::port_busy("COM1").is_local());
        assert!(IoError::timeout("x", "read").is_local());
        assert!(!IoError::invalid_argument("bad").is_local());
        assert!(!IoError::protocol("ee31", "x").is_local());
    }
}
