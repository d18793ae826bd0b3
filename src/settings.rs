// src/settings.rs
//
// Runtime settings of the probe link. Every field has a default so a partial
// (or empty) TOML file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::io::emulation::EmulatedDeviceSettings;
use crate::io::serial::ComPortSettings;
use crate::io::IoError;

/// Durations are stored as whole milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Bounded retry with a fixed pause between attempts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn production() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(20),
        }
    }

    /// No retries: failures surface immediately
    pub const fn stress() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::production()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProbeSettings {
    /// Receive timeout of a regular command (`DeviceManager::executor`)
    #[serde(default = "default_command_timeout", with = "duration_ms")]
    pub command_timeout: Duration,
    /// Receive timeout of one discovery broadcast
    #[serde(default = "default_discovery_timeout", with = "duration_ms")]
    pub discovery_timeout: Duration,
    /// How often the UART scan loop checks for cancellation between passes
    #[serde(default = "default_uart_poll_interval", with = "duration_ms")]
    pub uart_poll_interval: Duration,
    /// Quiet time forced on a bus before discovery starts
    #[serde(default = "default_bus_silence", with = "duration_ms")]
    pub bus_silence: Duration,
    /// Pause between announcing a device and muting it
    #[serde(default = "default_ack_delay", with = "duration_ms")]
    pub ack_delay: Duration,
    /// Consecutive discovery attempts without a new device that end a pass
    #[serde(default = "default_empty_attempt_limit")]
    pub empty_attempt_limit: u32,
    /// Line settings tried on every port, in order
    #[serde(default = "default_uart_candidates")]
    pub uart_candidates: Vec<ComPortSettings>,
    /// Friendly-name substrings identifying the vendor USB adapter
    #[serde(default = "default_adapter_names")]
    pub adapter_names: Vec<String>,
    /// Manufacturer code expected in BLE advertisements
    #[serde(default = "default_ble_vendor_code")]
    pub ble_vendor_code: u16,
    #[serde(default = "default_ble_min_mtu")]
    pub ble_min_mtu: u16,
    /// Timeouts of the two discovery calls that revive a known UART device
    #[serde(default = "default_revive_timeouts")]
    pub revive_timeouts_ms: [u64; 2],
    #[serde(default)]
    pub ble_write_retry: RetryPolicy,
    #[serde(default)]
    pub emulated_devices: Vec<EmulatedDeviceSettings>,
}

fn default_command_timeout() -> Duration {
    Duration::from_millis(500)
}
fn default_discovery_timeout() -> Duration {
    Duration::from_millis(300)
}
fn default_uart_poll_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_bus_silence() -> Duration {
    Duration::from_millis(50)
}
fn default_ack_delay() -> Duration {
    Duration::from_millis(50)
}
fn default_empty_attempt_limit() -> u32 {
    3
}
fn default_uart_candidates() -> Vec<ComPortSettings> {
    vec![ComPortSettings::default_8n1(), ComPortSettings::alternate_8e1()]
}
fn default_adapter_names() -> Vec<String> {
    vec!["Uni-Adapter".to_string(), "E+E USB".to_string()]
}
fn default_ble_vendor_code() -> u16 {
    0x1CD1
}
fn default_ble_min_mtu() -> u16 {
    256
}
fn default_revive_timeouts() -> [u64; 2] {
    [100, 50]
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            command_timeout: default_command_timeout(),
            discovery_timeout: default_discovery_timeout(),
            uart_poll_interval: default_uart_poll_interval(),
            bus_silence: default_bus_silence(),
            ack_delay: default_ack_delay(),
            empty_attempt_limit: default_empty_attempt_limit(),
            uart_candidates: default_uart_candidates(),
            adapter_names: default_adapter_names(),
            ble_vendor_code: default_ble_vendor_code(),
            ble_min_mtu: default_ble_min_mtu(),
            revive_timeouts_ms: default_revive_timeouts(),
            ble_write_retry: RetryPolicy::production(),
            emulated_devices: Vec::new(),
        }
    }
}

impl ProbeSettings {
    pub fn from_toml_str(content: &str) -> Result<Self, IoError> {
        toml::from_str(content)
            .map_err(|e| IoError::configuration(format!("failed to parse settings: {}", e)))
    }

    pub fn to_toml_string(&self) -> Result<String, IoError> {
        toml::to_string_pretty(self)
            .map_err(|e| IoError::configuration(format!("failed to serialise settings: {}", e)))
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, IoError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn save(&self, path: &Path) -> Result<(), IoError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn revive_timeouts(&self) -> [Duration; 2] {
        self.revive_timeouts_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let settings = ProbeSettings::from_toml_str("").unwrap();
        assert_eq!(settings, ProbeSettings::default());
        assert_eq!(settings.uart_poll_interval, Duration::from_secs(1));
        assert_eq!(settings.ble_vendor_code, 0x1CD1);
        assert_eq!(settings.empty_attempt_limit, 3);
        assert_eq!(settings.ble_write_retry, RetryPolicy::production());
    }

    #[test]
    fn test_partial_file() {
        let toml = r#"
            command_timeout = 800
            uart_candidates = ["19200 8N1"]
            adapter_names = ["My Adapter"]

            [ble_write_retry]
            max_retries = 0
            backoff = 0

            [[emulated_devices]]
            bus_address = 5
            model = "EE210"
        "#;
        let settings = ProbeSettings::from_toml_str(toml).unwrap();
        assert_eq!(settings.command_timeout, Duration::from_millis(800));
        assert_eq!(settings.uart_candidates[0].baud_rate, 19200);
        assert_eq!(settings.adapter_names, vec!["My Adapter".to_string()]);
        assert_eq!(settings.ble_write_retry, RetryPolicy::stress());
        assert_eq!(settings.emulated_devices.len(), 1);
        assert!(settings.emulated_devices[0].is_ee_probe);
        assert_eq!(settings.ack_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_line_settings_rejected() {
        let err = ProbeSettings::from_toml_str(r#"uart_candidates = ["9600 9Q1"]"#);
        assert!(matches!(err, Err(IoError::Configuration(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("ee31link-settings-{}", std::process::id()));
        let path = dir.join("probe.toml");
        let mut settings = ProbeSettings::default();
        settings.emulated_devices.push(EmulatedDeviceSettings::new(9, "EE871"));
        settings.save(&path).unwrap();

        let loaded = ProbeSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(ProbeSettings::load(&dir.join("missing.toml")).unwrap(), ProbeSettings::default());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
