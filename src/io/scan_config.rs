// src/io/scan_config.rs
//
// Scan configurations: how to look for probes on one transport.

use std::fmt;

use super::emulation::EmulatedDeviceSettings;
use super::serial::ComPortSettings;
use super::InterfaceType;

/// BLE scan: optionally restricted to one peripheral id
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BleScanConfig {
    pub target: Option<String>,
}

impl BleScanConfig {
    pub fn with_target(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
        }
    }

    /// Whether a peripheral id passes the target filter (case-insensitive)
    pub fn accepts(&self, peripheral_id: &str) -> bool {
        match &self.target {
            Some(t) => t.eq_ignore_ascii_case(peripheral_id),
            None => true,
        }
    }
}

/// UART scan: one fixed port or every enumerable port, with line settings.
#[derive(Clone, Debug, Default)]
pub struct UartScanConfig {
    pub port_name: Option<String>,
    pub settings: ComPortSettings,
    /// Set when opening the port failed because another process holds it
    pub unauthorized_access: bool,
}

impl UartScanConfig {
    pub fn new(port_name: Option<String>, settings: ComPortSettings) -> Self {
        Self {
            port_name,
            settings,
            unauthorized_access: false,
        }
    }

    pub fn for_port(port_name: impl Into<String>, settings: ComPortSettings) -> Self {
        Self::new(Some(port_name.into()), settings)
    }
}

// The access flag is runtime state, not part of the identity
impl PartialEq for UartScanConfig {
    fn eq(&self, other: &Self) -> bool {
        self.port_name == other.port_name && self.settings == other.settings
    }
}

impl Eq for UartScanConfig {}

/// Emulation scan: the emulated probes to materialise
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EmulationScanConfig {
    pub devices: Vec<EmulatedDeviceSettings>,
}

/// Per-transport descriptor of how to look for devices.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanConfiguration {
    Ble(BleScanConfig),
    Uart(UartScanConfig),
    Emulation(EmulationScanConfig),
}

impl ScanConfiguration {
    pub fn interface_type(&self) -> InterfaceType {
        match self {
            ScanConfiguration::Ble(_) => InterfaceType::Ble,
            ScanConfiguration::Uart(_) => InterfaceType::Uart,
            ScanConfiguration::Emulation(_) => InterfaceType::Emulation,
        }
    }

    pub fn as_uart(&self) -> Option<&UartScanConfig> {
        match self {
            ScanConfiguration::Uart(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for ScanConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanConfiguration::Ble(c) => match &c.target {
                Some(t) => write!(f, "ble:{}", t),
                None => f.write_str("ble:*"),
            },
            ScanConfiguration::Uart(c) => write!(
                f,
                "uart:{} {}",
                c.port_name.as_deref().unwrap_or("*"),
                c.settings
            ),
            ScanConfiguration::Emulation(c) => write!(f, "emulation:{} devices", c.devices.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uart_equality_ignores_access_flag() {
        let a = UartScanConfig::for_port("COM3", ComPortSettings::default_8n1());
        let mut b = a.clone();
        b.unauthorized_access = true;
        assert_eq!(a, b);
        let c = UartScanConfig::for_port("COM3", ComPortSettings::alternate_8e1());
        assert_ne!(a, c);
    }

    #[test]
    fn test_ble_target_filter() {
        assert!(BleScanConfig::default().accepts("anything"));
        let cfg = BleScanConfig::with_target("AA:BB:CC:DD:EE:FF");
        assert!(cfg.accepts("aa:bb:cc:dd:ee:ff"));
        assert!(!cfg.accepts("11:22:33:44:55:66"));
    }

    #[test]
    fn test_display() {
        let cfg = ScanConfiguration::Uart(UartScanConfig::for_port("COM7", ComPortSettings::alternate_8e1()));
        assert_eq!(cfg.to_string(), "uart:COM7 9600 8E1");
        assert_eq!(cfg.interface_type(), InterfaceType::Uart);
        assert_eq!(ScanConfiguration::Ble(BleScanConfig::default()).to_string(), "ble:*");
    }
}
