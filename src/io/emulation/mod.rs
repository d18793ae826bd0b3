// src/io/emulation/mod.rs
//
// Software probes that speak EE31, used for demos and as the hardware
// stand-in throughout the test suite.
//
// - `EmulatedProbe`: the probe itself (state + command handling)
// - `EmulationChannel`: a point-to-point channel to one probe
// - `EmulatedPortProvider`: a simulated RS-485 bus behind the serial seam

mod bus;
mod channel;
mod probe;

pub use bus::EmulatedPortProvider;
pub use channel::EmulationChannel;
pub use probe::EmulatedProbe;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::serial::ComPortSettings;

fn default_true() -> bool {
    true
}

/// Configuration of one emulated probe
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmulatedDeviceSettings {
    pub bus_address: u8,
    pub model: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_ee_probe: bool,
    #[serde(default)]
    pub calib_expiration: Option<NaiveDate>,
    /// Line settings the probe listens with when attached to an emulated bus
    #[serde(default)]
    pub line_settings: ComPortSettings,
}

impl EmulatedDeviceSettings {
    pub fn new(bus_address: u8, model: impl Into<String>) -> Self {
        Self {
            bus_address,
            model: model.into(),
            name: String::new(),
            is_ee_probe: true,
            calib_expiration: None,
            line_settings: ComPortSettings::default_8n1(),
        }
    }

    pub fn with_line_settings(mut self, line_settings: ComPortSettings) -> Self {
        self.line_settings = line_settings;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Interface id of the channel that talks to this probe
    pub fn interface_id(&self) -> String {
        format!("emu#{}", self.bus_address)
    }
}
