// src/io/serial/port.rs
//
// Host serial port access.
//
// `PortProvider` enumerates and opens ports, `SerialLink` is one open port.
// `SystemPorts` backs both with the serialport crate; the emulated bus
// implements the same seam for tests. `PortPool` shares one open handle
// between every channel addressing a probe on the same port, since an OS
// serial port can only be opened once.

use serde::Serialize;
use serialport::{SerialPort, SerialPortType};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};

use super::utils::{
    to_serialport_data_bits, to_serialport_flow_control, to_serialport_parity,
    to_serialport_stop_bits, ComPortSettings,
};
use crate::io::IoError;

// ============================================================================
// Seam
// ============================================================================

/// Information about an available serial port
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PortDescriptor {
    pub port_name: String,
    /// Product / manufacturer text reported by the OS (may be empty)
    pub friendly_name: String,
    pub port_type: String,
}

/// One open serial port
pub trait SerialLink: Send {
    /// Apply new line settings to the open port
    fn reconfigure(&mut self, settings: &ComPortSettings) -> Result<(), IoError>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError>;

    fn bytes_to_read(&mut self) -> Result<usize, IoError>;

    fn bytes_to_write(&mut self) -> Result<usize, IoError>;

    /// Read only what is already buffered; never waits
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, IoError>;

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<(), IoError>;
}

/// Enumerates and opens serial ports
pub trait PortProvider: Send + Sync {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, IoError>;

    fn open(&self, port_name: &str, settings: &ComPortSettings)
        -> Result<Box<dyn SerialLink>, IoError>;
}

/// Whether a port's friendly name marks it as the vendor USB adapter
pub fn is_uni_adapter(friendly_name: &str, patterns: &[String]) -> bool {
    let name = friendly_name.to_lowercase();
    patterns
        .iter()
        .filter(|p| !p.is_empty())
        .any(|p| name.contains(&p.to_lowercase()))
}

// ============================================================================
// serialport backend
// ============================================================================

/// Ports of the host, through the serialport crate
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPorts;

fn map_serial_error(port: &str, e: serialport::Error) -> IoError {
    let busy = matches!(
        e.kind,
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied)
    ) || {
        let text = e.description.to_lowercase();
        text.contains("busy") || text.contains("denied") || text.contains("in use")
    };
    if busy {
        IoError::port_busy(port)
    } else {
        IoError::connection(port, e.description)
    }
}

impl PortProvider for SystemPorts {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, IoError> {
        let ports = serialport::available_ports()
            .map_err(|e| IoError::connection("serial", format!("failed to enumerate ports: {}", e)))?;

        Ok(ports
            .into_iter()
            // macOS lists every device twice, keep the calling units (/dev/cu.*)
            .filter(|_p| {
                #[cfg(target_os = "macos")]
                {
                    !_p.port_name.starts_with("/dev/tty.")
                }
                #[cfg(not(target_os = "macos"))]
                {
                    true
                }
            })
            .map(|p| {
                let (port_type, friendly_name) = match p.port_type {
                    SerialPortType::UsbPort(info) => (
                        "USB".to_string(),
                        info.product.or(info.manufacturer).unwrap_or_default(),
                    ),
                    SerialPortType::BluetoothPort => ("Bluetooth".to_string(), String::new()),
                    SerialPortType::PciPort => ("PCI".to_string(), String::new()),
                    SerialPortType::Unknown => ("Unknown".to_string(), String::new()),
                };
                PortDescriptor {
                    port_name: p.port_name,
                    friendly_name,
                    port_type,
                }
            })
            .collect())
    }

    fn open(
        &self,
        port_name: &str,
        settings: &ComPortSettings,
    ) -> Result<Box<dyn SerialLink>, IoError> {
        let port = serialport::new(port_name, settings.baud_rate)
            .data_bits(to_serialport_data_bits(settings.data_bits))
            .parity(to_serialport_parity(settings.parity))
            .stop_bits(to_serialport_stop_bits(settings.stop_bits))
            .flow_control(to_serialport_flow_control(settings.handshake))
            .timeout(settings.read_timeout)
            .open()
            .map_err(|e| map_serial_error(port_name, e))?;

        tlog!("[uart] Opened {} at {}", port_name, settings);
        Ok(Box::new(SystemLink {
            name: port_name.to_string(),
            port,
        }))
    }
}

struct SystemLink {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialLink for SystemLink {
    fn reconfigure(&mut self, settings: &ComPortSettings) -> Result<(), IoError> {
        let name = self.name.clone();
        let map = |e| map_serial_error(&name, e);
        self.port.set_baud_rate(settings.baud_rate).map_err(map)?;
        self.port
            .set_data_bits(to_serialport_data_bits(settings.data_bits))
            .map_err(map)?;
        self.port
            .set_parity(to_serialport_parity(settings.parity))
            .map_err(map)?;
        self.port
            .set_stop_bits(to_serialport_stop_bits(settings.stop_bits))
            .map_err(map)?;
        self.port
            .set_flow_control(to_serialport_flow_control(settings.handshake))
            .map_err(map)?;
        self.port.set_timeout(settings.read_timeout).map_err(map)?;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize, IoError> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| map_serial_error(&self.name, e))
    }

    fn bytes_to_write(&mut self) -> Result<usize, IoError> {
        self.port
            .bytes_to_write()
            .map(|n| n as usize)
            .map_err(|e| map_serial_error(&self.name, e))
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let available = self.bytes_to_read()?.min(buf.len());
        if available == 0 {
            return Ok(0);
        }
        match self.port.read(&mut buf[..available]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<(), IoError> {
        let name = self.name.clone();
        self.port
            .write_data_terminal_ready(dtr)
            .map_err(|e| map_serial_error(&name, e))?;
        self.port
            .write_request_to_send(rts)
            .map_err(|e| map_serial_error(&name, e))?;
        Ok(())
    }
}

// ============================================================================
// Shared handles
// ============================================================================

struct SlotInner {
    link: Box<dyn SerialLink>,
    settings: ComPortSettings,
}

/// One open port, shared by every channel on it. All access goes through
/// `with_link`, which serialises callers and applies their line settings.
pub struct PortSlot {
    port_name: String,
    inner: Mutex<SlotInner>,
}

impl PortSlot {
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` on the link with `settings` applied. Blocking.
    pub fn with_link<R>(
        &self,
        settings: &ComPortSettings,
        f: impl FnOnce(&mut dyn SerialLink) -> Result<R, IoError>,
    ) -> Result<R, IoError> {
        let mut inner = self.lock();
        if inner.settings != *settings {
            inner.link.reconfigure(settings)?;
            inner.settings = settings.clone();
        }
        f(inner.link.as_mut())
    }

    /// Run `f` on the link only if nobody else holds it; never blocks and
    /// leaves the line settings alone.
    pub fn try_with_link<R>(&self, f: impl FnOnce(&mut dyn SerialLink) -> Result<R, IoError>) -> Option<R> {
        let mut inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        f(inner.link.as_mut()).ok()
    }
}

/// Opens ports on demand and hands out shared handles. A port is closed
/// when its last handle is dropped.
pub struct PortPool {
    provider: Arc<dyn PortProvider>,
    slots: Mutex<HashMap<String, Weak<PortSlot>>>,
}

impl PortPool {
    pub fn new(provider: Arc<dyn PortProvider>) -> Self {
        Self {
            provider,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn PortProvider> {
        &self.provider
    }

    pub fn list_ports(&self) -> Result<Vec<PortDescriptor>, IoError> {
        self.provider.list_ports()
    }

    /// Shared handle to `port_name`, opening it with `settings` if nobody
    /// holds it yet. Blocking.
    pub fn acquire(
        &self,
        port_name: &str,
        settings: &ComPortSettings,
    ) -> Result<Arc<PortSlot>, IoError> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = slots.get(port_name).and_then(Weak::upgrade) {
            return Ok(slot);
        }

        let link = self.provider.open(port_name, settings)?;
        let slot = Arc::new(PortSlot {
            port_name: port_name.to_string(),
            inner: Mutex::new(SlotInner {
                link,
                settings: settings.clone(),
            }),
        });
        slots.retain(|_, weak| weak.strong_count() > 0);
        slots.insert(port_name.to_string(), Arc::downgrade(&slot));
        Ok(slot)
    }

    /// Number of ports currently held open
    pub fn open_ports(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.values().filter(|w| w.strong_count() > 0).count()
    }
}
