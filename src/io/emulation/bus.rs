// src/io/emulation/bus.rs
//
// Simulated RS-485 multidrop bus behind the serial `PortProvider` seam.
//
// Each emulated port carries any number of probes. A probe only understands
// requests sent with its own line settings. When several probes answer the
// same request their replies collide; the lowest bus address wins the
// arbitration and is the only reply the host receives.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{EmulatedDeviceSettings, EmulatedProbe};
use crate::ee31::frame::FrameParser;
use crate::io::serial::{ComPortSettings, PortDescriptor, PortProvider, SerialLink};
use crate::io::IoError;

#[derive(Default)]
struct EmulatedPort {
    friendly_name: String,
    probes: Vec<EmulatedProbe>,
    /// Simulates another process holding the port
    busy: bool,
    open_count: usize,
    /// Last DTR/RTS levels driven by the host
    control_lines: (bool, bool),
}

type SharedPort = Arc<Mutex<EmulatedPort>>;

fn lock_port(port: &SharedPort) -> MutexGuard<'_, EmulatedPort> {
    port.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn same_line(a: &ComPortSettings, b: &ComPortSettings) -> bool {
    a.baud_rate == b.baud_rate
        && a.data_bits == b.data_bits
        && a.parity == b.parity
        && a.stop_bits == b.stop_bits
}

#[derive(Default)]
pub struct EmulatedPortProvider {
    ports: Mutex<HashMap<String, SharedPort>>,
}

impl EmulatedPortProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn port(&self, name: &str) -> Option<SharedPort> {
        let ports = self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ports.get(name).cloned()
    }

    pub fn add_port(&self, name: &str, friendly_name: &str) {
        let mut ports = self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ports.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(EmulatedPort {
                friendly_name: friendly_name.to_string(),
                ..Default::default()
            }))
        });
    }

    /// Put a probe on the bus of `port`, creating the port if needed
    pub fn attach(&self, port: &str, settings: EmulatedDeviceSettings) {
        self.add_port(port, "");
        if let Some(p) = self.port(port) {
            lock_port(&p).probes.push(EmulatedProbe::new(settings));
        }
    }

    pub fn set_busy(&self, port: &str, busy: bool) {
        if let Some(p) = self.port(port) {
            lock_port(&p).busy = busy;
        }
    }

    /// How many times `port` has been opened
    pub fn open_count(&self, port: &str) -> usize {
        self.port(port).map(|p| lock_port(&p).open_count).unwrap_or(0)
    }

    /// DTR/RTS levels last driven on `port`
    pub fn control_lines(&self, port: &str) -> (bool, bool) {
        self.port(port)
            .map(|p| lock_port(&p).control_lines)
            .unwrap_or_default()
    }

    /// Inspect the probe at `address` on `port`
    pub fn with_probe<R>(
        &self,
        port: &str,
        address: u8,
        f: impl FnOnce(&mut EmulatedProbe) -> R,
    ) -> Option<R> {
        let p = self.port(port)?;
        let mut guard = lock_port(&p);
        guard
            .probes
            .iter_mut()
            .find(|probe| probe.bus_address() == address)
            .map(f)
    }
}

impl PortProvider for EmulatedPortProvider {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, IoError> {
        let ports = self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut list: Vec<PortDescriptor> = ports
            .iter()
            .map(|(name, port)| PortDescriptor {
                port_name: name.clone(),
                friendly_name: lock_port(port).friendly_name.clone(),
                port_type: "Emulated".to_string(),
            })
            .collect();
        list.sort_by(|a, b| a.port_name.cmp(&b.port_name));
        Ok(list)
    }

    fn open(
        &self,
        port_name: &str,
        settings: &ComPortSettings,
    ) -> Result<Box<dyn SerialLink>, IoError> {
        let port = self
            .port(port_name)
            .ok_or_else(|| IoError::connection(port_name, "no such port"))?;
        {
            let mut guard = lock_port(&port);
            if guard.busy {
                return Err(IoError::port_busy(port_name));
            }
            guard.open_count += 1;
        }
        Ok(Box::new(EmulatedLink {
            port,
            settings: settings.clone(),
            parser: FrameParser::new(),
            rx: VecDeque::new(),
        }))
    }
}

struct EmulatedLink {
    port: SharedPort,
    settings: ComPortSettings,
    parser: FrameParser,
    rx: VecDeque<u8>,
}

impl SerialLink for EmulatedLink {
    fn reconfigure(&mut self, settings: &ComPortSettings) -> Result<(), IoError> {
        self.settings = settings.clone();
        self.parser.clear();
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        let mut port = lock_port(&self.port);
        for request in self.parser.feed(data) {
            let settings = &self.settings;
            let winner = port
                .probes
                .iter_mut()
                .filter(|p| same_line(&p.settings().line_settings, settings))
                .filter_map(|p| p.handle(&request))
                .min_by_key(|response| response.address);
            if let Some(response) = winner {
                self.rx.extend(response.encode()?);
            }
        }
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize, IoError> {
        Ok(self.rx.len())
    }

    fn bytes_to_write(&mut self) -> Result<usize, IoError> {
        Ok(0)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<(), IoError> {
        lock_port(&self.port).control_lines = (dtr, rts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ee31::commands::{CommandParameter, DiscoveryParameter};
    use crate::ee31::frame::{Frame, Opcode};

    fn discovery_bytes(session: u16) -> Vec<u8> {
        let p = DiscoveryParameter::broadcast(session);
        Frame::new(0, Opcode::Discovery, p.to_payload()).encode().unwrap()
    }

    #[test]
    fn test_lowest_address_wins() {
        let bus = EmulatedPortProvider::new();
        bus.attach("COM1", EmulatedDeviceSettings::new(9, "EE07"));
        bus.attach("COM1", EmulatedDeviceSettings::new(4, "EE210"));

        let mut link = bus.open("COM1", &ComPortSettings::default_8n1()).unwrap();
        link.write_all(&discovery_bytes(1)).unwrap();
        let mut buf = [0u8; 64];
        let n = link.read_available(&mut buf).unwrap();
        let mut parser = FrameParser::new();
        let frames = parser.feed(&buf[..n]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].address, 4);
    }

    #[test]
    fn test_line_settings_must_match() {
        let bus = EmulatedPortProvider::new();
        bus.attach(
            "COM2",
            EmulatedDeviceSettings::new(7, "EE210").with_line_settings(ComPortSettings::alternate_8e1()),
        );
        let mut link = bus.open("COM2", &ComPortSettings::default_8n1()).unwrap();
        link.write_all(&discovery_bytes(1)).unwrap();
        assert_eq!(link.bytes_to_read().unwrap(), 0);

        link.reconfigure(&ComPortSettings::alternate_8e1()).unwrap();
        link.write_all(&discovery_bytes(2)).unwrap();
        assert!(link.bytes_to_read().unwrap() > 0);
    }

    #[test]
    fn test_busy_port() {
        let bus = EmulatedPortProvider::new();
        bus.add_port("COM3", "E+E Uni-Adapter");
        bus.set_busy("COM3", true);
        let err = bus.open("COM3", &ComPortSettings::default_8n1()).err();
        assert!(matches!(err, Some(IoError::PortBusy { .. })));
        assert_eq!(bus.open_count("COM3"), 0);
        assert_eq!(bus.list_ports().unwrap()[0].friendly_name, "E+E Uni-Adapter");
    }
}
