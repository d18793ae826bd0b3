// src/io/serial/channel.rs
//
// Channel to one probe on a serial (RS-485) bus.
//
// Several channels can address probes on the same port; they share one open
// handle through the `PortPool`. Blocking port access runs on the blocking
// thread pool. Connect, disconnect and I/O of one channel are serialised by
// its own lock, independent of every other channel.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

use super::port::{PortPool, PortSlot};
use super::utils::ComPortSettings;
use crate::io::{
    remember_configuration, Channel, InterfaceType, IoError, ScanConfiguration, UartScanConfig,
};

struct UartState {
    port_name: String,
    config: UartScanConfig,
    used: Vec<ScanConfiguration>,
    slot: Option<Arc<PortSlot>>,
    model: String,
    is_uni_adapter: bool,
}

pub struct UartChannel {
    pool: Arc<PortPool>,
    bus_address: u8,
    io_lock: tokio::sync::Mutex<()>,
    state: Mutex<UartState>,
}

fn join_error(id: &str, e: tokio::task::JoinError) -> IoError {
    IoError::connection(id, format!("serial task failed: {}", e))
}

impl UartChannel {
    /// Channel to the probe at `bus_address` (0 for the discovery probe
    /// channel) on the port named by `config`.
    pub fn new(
        pool: Arc<PortPool>,
        config: UartScanConfig,
        bus_address: u8,
        is_uni_adapter: bool,
    ) -> Result<Self, IoError> {
        let port_name = config
            .port_name
            .clone()
            .ok_or_else(|| IoError::configuration("UART channel needs a port name"))?;

        Ok(Self {
            pool,
            bus_address,
            io_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(UartState {
                port_name,
                used: vec![ScanConfiguration::Uart(config.clone())],
                config,
                slot: None,
                model: String::new(),
                is_uni_adapter,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, UartState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn port_name(&self) -> String {
        self.lock().port_name.clone()
    }

    pub fn settings(&self) -> ComPortSettings {
        self.lock().config.settings.clone()
    }

    /// Whether the last connect failed because another process holds the port
    pub fn unauthorized_access(&self) -> bool {
        self.lock().config.unauthorized_access
    }

    pub fn set_uni_adapter(&self, is_uni_adapter: bool) {
        self.lock().is_uni_adapter = is_uni_adapter;
    }

    fn connected_slot(&self) -> Result<(Arc<PortSlot>, ComPortSettings), IoError> {
        let state = self.lock();
        match &state.slot {
            Some(slot) => Ok((slot.clone(), state.config.settings.clone())),
            None => Err(IoError::NotConnected(format!(
                "{}#{}",
                state.port_name, self.bus_address
            ))),
        }
    }

    async fn connect_locked(&self) -> Result<(), IoError> {
        let (port_name, settings, uni) = {
            let state = self.lock();
            if state.slot.is_some() {
                return Ok(());
            }
            (
                state.port_name.clone(),
                state.config.settings.clone(),
                state.is_uni_adapter,
            )
        };
        let id = self.interface_id();

        let pool = self.pool.clone();
        let result = {
            let port_name = port_name.clone();
            tokio::task::spawn_blocking(move || {
                let slot = pool.acquire(&port_name, &settings)?;
                if uni {
                    // The adapter draws its power from DTR/RTS
                    slot.with_link(&settings, |link| link.set_control_lines(true, true))?;
                }
                Ok::<_, IoError>(slot)
            })
            .await
            .map_err(|e| join_error(&id, e))?
        };

        let mut state = self.lock();
        match result {
            Ok(slot) => {
                state.slot = Some(slot);
                state.config.unauthorized_access = false;
                Ok(())
            }
            Err(e @ IoError::PortBusy { .. }) => {
                tlog!("[uart] {} is held by another process, skipping", port_name);
                state.config.unauthorized_access = true;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn disconnect_locked(&self) {
        let slot = self.lock().slot.take();
        if slot.is_some() {
            tlog!("[uart] {} disconnected", self.interface_id());
        }
        // Dropping the last handle closes the port; that can block
        if let Some(slot) = slot {
            let _ = tokio::task::spawn_blocking(move || drop(slot)).await;
        }
    }
}

#[async_trait]
impl Channel for UartChannel {
    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Uart
    }

    fn interface_id(&self) -> String {
        format!("{}#{}", self.lock().port_name, self.bus_address)
    }

    fn is_uni_adapter(&self) -> bool {
        self.lock().is_uni_adapter
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
        self.lock().slot.is_some()
    }

    fn bytes_to_read(&self) -> usize {
        match self.connected_slot() {
            Ok((slot, _)) => slot.try_with_link(|link| link.bytes_to_read()).unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn bytes_to_write(&self) -> usize {
        match self.connected_slot() {
            Ok((slot, _)) => slot.try_with_link(|link| link.bytes_to_write()).unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn scan_configuration(&self) -> ScanConfiguration {
        ScanConfiguration::Uart(self.lock().config.clone())
    }

    fn used_configurations(&self) -> Vec<ScanConfiguration> {
        self.lock().used.clone()
    }

    async fn set_scan_configuration(&self, config: ScanConfiguration) -> Result<(), IoError> {
        let uart = match config {
            ScanConfiguration::Uart(c) => c,
            other => {
                return Err(IoError::invalid_argument(format!(
                    "UART channel cannot use {} configuration",
                    other.interface_type()
                )))
            }
        };
        let port_name = uart
            .port_name
            .clone()
            .ok_or_else(|| IoError::invalid_argument("UART configuration without a port name"))?;

        let _io = self.io_lock.lock().await;
        self.disconnect_locked().await;
        {
            let mut state = self.lock();
            remember_configuration(&mut state.used, &ScanConfiguration::Uart(uart.clone()));
            state.port_name = port_name;
            state.config = uart;
        }
        self.connect_locked().await
    }

    async fn ensure_connection(&self) -> Result<(), IoError> {
        let _io = self.io_lock.lock().await;
        self.connect_locked().await
    }

    async fn disconnect(&self) -> Result<(), IoError> {
        let _io = self.io_lock.lock().await;
        self.disconnect_locked().await;
        Ok(())
    }

    async fn read_bytes(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        let _io = self.io_lock.lock().await;
        let (slot, settings) = self.connected_slot()?;
        let id = self.interface_id();
        let len = buf.len();

        let data = tokio::task::spawn_blocking(move || {
            let mut tmp = vec![0u8; len];
            let n = slot.with_link(&settings, |link| link.read_available(&mut tmp))?;
            tmp.truncate(n);
            Ok::<_, IoError>(tmp)
        })
        .await
        .map_err(|e| join_error(&id, e))??;

        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn write_bytes(&self, data: &[u8]) -> Result<(), IoError> {
        let _io = self.io_lock.lock().await;
        let (slot, settings) = self.connected_slot()?;
        let id = self.interface_id();
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || {
            slot.with_link(&settings, |link| link.write_all(&data))
        })
        .await
        .map_err(|e| join_error(&id, e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ee31::commands::ProbeIdentityGetParameter;
    use crate::ee31::{CommandExecutor, ResultCode};
    use crate::io::emulation::{EmulatedDeviceSettings, EmulatedPortProvider};

    fn bus_with_probe(port: &str, address: u8) -> Arc<EmulatedPortProvider> {
        let bus = Arc::new(EmulatedPortProvider::new());
        bus.add_port(port, "E+E Uni-Adapter");
        bus.attach(port, EmulatedDeviceSettings::new(address, "EE210"));
        bus
    }

    #[tokio::test]
    async fn test_interface_id_and_connect() {
        let bus = bus_with_probe("COM5", 12);
        let pool = Arc::new(PortPool::new(bus.clone()));
        let ch = UartChannel::new(
            pool.clone(),
            UartScanConfig::for_port("COM5", ComPortSettings::default_8n1()),
            12,
            true,
        )
        .unwrap();

        assert_eq!(ch.interface_id(), "COM5#12");
        assert!(ch.is_uni_adapter());
        assert!(!ch.is_connected());

        ch.ensure_connection().await.unwrap();
        ch.ensure_connection().await.unwrap();
        assert!(ch.is_connected());
        assert_eq!(bus.open_count("COM5"), 1);
        assert_eq!(bus.control_lines("COM5"), (true, true));

        ch.disconnect().await.unwrap();
        ch.disconnect().await.unwrap();
        assert!(!ch.is_connected());
        assert_eq!(pool.open_ports(), 0);
    }

    #[tokio::test]
    async fn test_counters_do_not_wait_for_a_held_port() {
        let bus = bus_with_probe("COM5", 12);
        let pool = Arc::new(PortPool::new(bus));
        let ch = UartChannel::new(
            pool.clone(),
            UartScanConfig::for_port("COM5", ComPortSettings::default_8n1()),
            12,
            false,
        )
        .unwrap();
        ch.ensure_connection().await.unwrap();

        // another caller sits inside a slow blocking operation on the port
        let slot = pool.acquire("COM5", &ComPortSettings::default_8n1()).unwrap();
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            slot.with_link(&ComPortSettings::default_8n1(), |_link| {
                let _ = held_tx.send(());
                std::thread::sleep(std::time::Duration::from_millis(300));
                Ok(())
            })
        });
        held_rx.recv().unwrap();

        let started = std::time::Instant::now();
        assert_eq!(ch.bytes_to_read(), 0);
        assert_eq!(ch.bytes_to_write(), 0);
        assert!(started.elapsed() < std::time::Duration::from_millis(200));
        holder.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_busy_port_sets_flag() {
        let bus = bus_with_probe("COM6", 3);
        bus.set_busy("COM6", true);
        let pool = Arc::new(PortPool::new(bus));
        let ch = UartChannel::new(
            pool,
            UartScanConfig::for_port("COM6", ComPortSettings::default_8n1()),
            3,
            false,
        )
        .unwrap();

        let err = ch.ensure_connection().await.err();
        assert!(matches!(err, Some(IoError::PortBusy { .. })));
        assert!(ch.unauthorized_access());
        match ch.scan_configuration() {
            ScanConfiguration::Uart(c) => assert!(c.unauthorized_access),
            other => panic!("unexpected configuration {}", other),
        }
    }

    #[tokio::test]
    async fn test_channels_share_the_port() {
        let bus = bus_with_probe("COM7", 4);
        bus.attach("COM7", EmulatedDeviceSettings::new(8, "EE07"));
        let pool = Arc::new(PortPool::new(bus.clone()));
        let config = UartScanConfig::for_port("COM7", ComPortSettings::default_8n1());

        let a: Arc<dyn Channel> = Arc::new(UartChannel::new(pool.clone(), config.clone(), 4, false).unwrap());
        let b: Arc<dyn Channel> = Arc::new(UartChannel::new(pool.clone(), config, 8, false).unwrap());

        let ra = CommandExecutor::new(a.clone()).execute(&ProbeIdentityGetParameter).await;
        let rb = CommandExecutor::new(b.clone()).execute(&ProbeIdentityGetParameter).await;
        assert_eq!(ra.code, ResultCode::Success);
        assert_eq!(rb.code, ResultCode::Success);
        assert_eq!(ra.result.identity.bus_address, 4);
        assert_eq!(rb.result.identity.bus_address, 8);
        assert_eq!(bus.open_count("COM7"), 1);
    }

    #[tokio::test]
    async fn test_retarget_records_history() {
        let bus = bus_with_probe("COM1", 2);
        bus.add_port("COM2", "");
        let pool = Arc::new(PortPool::new(bus));
        let ch = UartChannel::new(
            pool,
            UartScanConfig::for_port("COM1", ComPortSettings::default_8n1()),
            0,
            false,
        )
        .unwrap();

        let next = UartScanConfig::for_port("COM2", ComPortSettings::alternate_8e1());
        ch.set_scan_configuration(ScanConfiguration::Uart(next.clone()))
            .await
            .unwrap();
        assert_eq!(ch.interface_id(), "COM2#0");
        assert_eq!(ch.settings(), ComPortSettings::alternate_8e1());
        assert_eq!(ch.used_configurations().len(), 2);

        let bad = ScanConfiguration::Uart(UartScanConfig::default());
        assert!(ch.set_scan_configuration(bad).await.is_err());
    }

    #[test]
    fn test_requires_port_name() {
        let pool = Arc::new(PortPool::new(Arc::new(EmulatedPortProvider::new())));
        assert!(UartChannel::new(pool, UartScanConfig::default(), 1, false).is_err());
    }
}
