// src/io/emulation/channel.rs
//
// Point-to-point channel to one in-process `EmulatedProbe`. Written frames
// are answered synchronously; responses queue up until read.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use super::{EmulatedDeviceSettings, EmulatedProbe};
use crate::ee31::frame::FrameParser;
use crate::io::{
    remember_configuration, Channel, EmulationScanConfig, InterfaceType, IoError,
    ScanConfiguration,
};

struct EmulationState {
    probe: EmulatedProbe,
    parser: FrameParser,
    rx: VecDeque<u8>,
    connected: bool,
    model: String,
    config: ScanConfiguration,
    used: Vec<ScanConfiguration>,
}

pub struct EmulationChannel {
    interface_id: String,
    bus_address: u8,
    state: Mutex<EmulationState>,
}

impl EmulationChannel {
    pub fn new(settings: EmulatedDeviceSettings) -> Self {
        let config = ScanConfiguration::Emulation(EmulationScanConfig {
            devices: vec![settings.clone()],
        });
        Self::with_configuration(settings, config)
    }

    /// Channel created by an emulation scan with `config`
    pub fn with_configuration(settings: EmulatedDeviceSettings, config: ScanConfiguration) -> Self {
        let state = EmulationState {
            model: settings.model.clone(),
            probe: EmulatedProbe::new(settings.clone()),
            parser: FrameParser::new(),
            rx: VecDeque::new(),
            connected: false,
            used: vec![config.clone()],
            config,
        };
        Self {
            interface_id: settings.interface_id(),
            bus_address: settings.bus_address,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EmulationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inspect or alter the emulated probe
    pub fn with_probe<R>(&self, f: impl FnOnce(&mut EmulatedProbe) -> R) -> R {
        f(&mut self.lock().probe)
    }
}

#[async_trait]
impl Channel for EmulationChannel {
    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Emulation
    }

    fn interface_id(&self) -> String {
        self.interface_id.clone()
    }

    fn bus_address(&self) -> u8 {
        self.bus_address
    }

    fn model(&self) -> String {
        self.lock().model.clone()
    }

    fn set_model(&self, model: &str) {
        self.lock().model = model.to_string();
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn bytes_to_read(&self) -> usize {
        self.lock().rx.len()
    }

    fn scan_configuration(&self) -> ScanConfiguration {
        self.lock().config.clone()
    }

    fn used_configurations(&self) -> Vec<ScanConfiguration> {
        self.lock().used.clone()
    }

    async fn set_scan_configuration(&self, config: ScanConfiguration) -> Result<(), IoError> {
        if config.interface_type() != InterfaceType::Emulation {
            return Err(IoError::invalid_argument(format!(
                "{} cannot use {} configuration",
                self.interface_id,
                config.interface_type()
            )));
        }
        self.disconnect().await?;
        {
            let mut state = self.lock();
            remember_configuration(&mut state.used, &config);
            state.config = config;
        }
        self.ensure_connection().await
    }

    async fn ensure_connection(&self) -> Result<(), IoError> {
        self.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), IoError> {
        let mut state = self.lock();
        state.connected = false;
        state.rx.clear();
        state.parser.clear();
        Ok(())
    }

    async fn read_bytes(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(IoError::NotConnected(self.interface_id.clone()));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn write_bytes(&self, data: &[u8]) -> Result<(), IoError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(IoError::NotConnected(self.interface_id.clone()));
        }
        let state = &mut *state;
        for request in state.parser.feed(data) {
            if let Some(response) = state.probe.handle(&request) {
                let bytes = response.encode()?;
                state.rx.extend(bytes);
            }
        }
        Ok(())
    }
}
