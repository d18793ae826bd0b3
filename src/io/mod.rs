// src/io/mod.rs
//
// Transport abstraction for sensor probes.
// A `Channel` is a duplex byte connection to exactly one probe, regardless of
// whether it runs over BLE, a multidrop RS-485 bus or the software emulation.

pub mod ble;
pub mod emulation;
mod error;
mod scan_config;
pub mod serial;

pub use error::IoError;
pub use scan_config::{BleScanConfig, EmulationScanConfig, ScanConfiguration, UartScanConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Identity
// ============================================================================

/// Transport kind of a channel / scan configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ble,
    Uart,
    Emulation,
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InterfaceType::Ble => "ble",
            InterfaceType::Uart => "uart",
            InterfaceType::Emulation => "emulation",
        })
    }
}

/// Identity of one physical probe. Two channels with the same key talk to
/// the same device.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub interface_type: InterfaceType,
    /// BLE: peripheral id, UART: "<port>#<bus address>", emulation: "emu#<bus address>"
    pub interface_id: String,
    pub is_uni_adapter: bool,
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.interface_type, self.interface_id)?;
        if self.is_uni_adapter {
            f.write_str("[uni]")?;
        }
        Ok(())
    }
}

/// Serializable snapshot of a channel, for observers and the CLI
#[derive(Clone, Debug, Serialize)]
pub struct ChannelInfo {
    pub key: ChannelKey,
    pub model: String,
    pub bus_address: u8,
    pub connected: bool,
    pub configuration: String,
}

// ============================================================================
// Channel Trait
// ============================================================================

/// Duplex byte connection to one probe.
///
/// Reads never block: they drain whatever the transport has buffered.
/// `write_bytes` sends one complete frame.
#[async_trait]
pub trait Channel: Send + Sync {
    fn interface_type(&self) -> InterfaceType;

    fn interface_id(&self) -> String;

    /// Whether the channel sits behind the vendor's USB adapter
    fn is_uni_adapter(&self) -> bool {
        false
    }

    fn key(&self) -> ChannelKey {
        ChannelKey {
            interface_type: self.interface_type(),
            interface_id: self.interface_id(),
            is_uni_adapter: self.is_uni_adapter(),
        }
    }

    /// Bus address used to address the probe (0 = broadcast / point-to-point)
    fn bus_address(&self) -> u8 {
        0
    }

    fn model(&self) -> String;

    fn set_model(&self, model: &str);

    fn is_connected(&self) -> bool;

    fn bytes_to_read(&self) -> usize;

    fn bytes_to_write(&self) -> usize {
        0
    }

    fn scan_configuration(&self) -> ScanConfiguration;

    /// Every configuration this channel has been switched to, oldest first
    fn used_configurations(&self) -> Vec<ScanConfiguration>;

    /// Disconnect, swap the active configuration and reconnect.
    async fn set_scan_configuration(&self, config: ScanConfiguration) -> Result<(), IoError>;

    /// Establish the connection if not already established.
    async fn ensure_connection(&self) -> Result<(), IoError>;

    /// Close the connection. Safe to call when not connected.
    async fn disconnect(&self) -> Result<(), IoError>;

    /// Drain up to `buf.len()` buffered bytes, returning how many were copied.
    async fn read_bytes(&self, buf: &mut [u8]) -> Result<usize, IoError>;

    async fn read_byte(&self) -> Result<Option<u8>, IoError> {
        let mut b = [0u8; 1];
        match self.read_bytes(&mut b).await? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }

    async fn write_bytes(&self, data: &[u8]) -> Result<(), IoError>;

    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            key: self.key(),
            model: self.model(),
            bus_address: self.bus_address(),
            connected: self.is_connected(),
            configuration: self.scan_configuration().to_string(),
        }
    }
}

pub type SharedChannel = Arc<dyn Channel>;

/// Record `config` in a used-configurations history unless already present
pub(crate) fn remember_configuration(history: &mut Vec<ScanConfiguration>, config: &ScanConfiguration) {
    if !history.iter().any(|c| c == config) {
        history.push(config.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_key_display() {
        let key = ChannelKey {
            interface_type: InterfaceType::Uart,
            interface_id: "/dev/ttyUSB0#12".to_string(),
            is_uni_adapter: true,
        };
        assert_eq!(key.to_string(), "uart(/dev/ttyUSB0#12)[uni]");
    }

    #[test]
    fn test_remember_configuration_dedups() {
        let mut history = Vec::new();
        let a = ScanConfiguration::Ble(BleScanConfig::default());
        let b = ScanConfiguration::Ble(BleScanConfig::with_target("AA:BB"));
        remember_configuration(&mut history, &a);
        remember_configuration(&mut history, &b);
        remember_configuration(&mut history, &a);
        assert_eq!(history, vec![a, b]);
    }
}
