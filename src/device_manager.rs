// src/device_manager.rs
//
// Discovery orchestrator and registry of found probes.
//
// One background activity per transport can run at a time:
// - BLE: an adapter event subscription that registers every advertising
//   probe once (deduplicated by peripheral id).
// - UART: a worker task that walks every candidate port/line setting,
//   broadcasts Discovery until the bus stays quiet and mutes each announced
//   probe with an addressed DiscoveryAck so the next one can surface.
// Emulation scans are synchronous.
//
// `stop_scan` cancels both activities and waits for them to exit; no
// notification is delivered after it returns.

use btleplug::api::{Central, CentralEvent, ScanFilter};
use futures::{FutureExt, StreamExt};
use once_cell::sync::OnceCell;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ee31::commands::discovery::new_session_id;
use crate::ee31::commands::{AnnouncedDevice, DiscoveryAckParameter, DiscoveryParameter};
use crate::ee31::frame::constants::BROADCAST;
use crate::ee31::{CommandExecutor, ResultCode};
use crate::io::ble::{self, is_probe_advertisement, BleChannel, BleLink, PeripheralLink};
use crate::io::emulation::{EmulatedDeviceSettings, EmulationChannel};
use crate::io::serial::{
    is_uni_adapter, PortDescriptor, PortPool, PortProvider, SystemPorts, UartChannel,
};
use crate::io::{
    BleScanConfig, Channel, ChannelKey, EmulationScanConfig, InterfaceType, IoError,
    ScanConfiguration, SharedChannel, UartScanConfig,
};
use crate::settings::ProbeSettings;

/// Receives discovery notifications. Callbacks run on the discovering task;
/// redispatch them if they must run elsewhere.
pub trait ScanObserver: Send + Sync {
    fn device_found(&self, manager: &DeviceManager, channel: &SharedChannel);

    /// A background scan hit a failure it cannot skip and has stopped
    fn scan_exception(&self, _manager: &DeviceManager, _error: &IoError) {}
}

struct UartScan {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ScanTasks {
    ble: Option<JoinHandle<()>>,
    uart: Option<UartScan>,
}

struct Inner {
    settings: ProbeSettings,
    pool: Arc<PortPool>,
    registry: Mutex<Vec<SharedChannel>>,
    observers: Mutex<Vec<Arc<dyn ScanObserver>>>,
    tasks: tokio::sync::Mutex<ScanTasks>,
}

/// Handle to the device manager; clones share the same state.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<Inner>,
}

static SHARED: OnceCell<DeviceManager> = OnceCell::new();

/// Create the process-wide manager on first call; later calls return it
/// unchanged.
pub fn init_shared(settings: ProbeSettings, provider: Arc<dyn PortProvider>) -> &'static DeviceManager {
    SHARED.get_or_init(|| DeviceManager::new(settings, provider))
}

/// The process-wide manager, if `init_shared` ran
pub fn shared() -> Option<&'static DeviceManager> {
    SHARED.get()
}

fn cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

impl DeviceManager {
    pub fn new(settings: ProbeSettings, provider: Arc<dyn PortProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                pool: Arc::new(PortPool::new(provider)),
                registry: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
                tasks: tokio::sync::Mutex::new(ScanTasks::default()),
            }),
        }
    }

    /// Manager over the host's serial ports
    pub fn with_system_ports(settings: ProbeSettings) -> Self {
        Self::new(settings, Arc::new(SystemPorts))
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.inner.settings
    }

    /// Executor for regular commands on `channel`, using the configured
    /// command timeout
    pub fn executor(&self, channel: SharedChannel) -> CommandExecutor {
        CommandExecutor::new(channel).with_timeout(self.inner.settings.command_timeout)
    }

    pub fn add_observer(&self, observer: Arc<dyn ScanObserver>) {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    fn registry(&self) -> MutexGuard<'_, Vec<SharedChannel>> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn observers(&self) -> Vec<Arc<dyn ScanObserver>> {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn notify_found(&self, channel: &SharedChannel) {
        for observer in self.observers() {
            observer.device_found(self, channel);
        }
    }

    fn notify_exception(&self, error: &IoError) {
        for observer in self.observers() {
            observer.scan_exception(self, error);
        }
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Snapshot of every registered channel, in discovery order
    pub fn devices(&self) -> Vec<SharedChannel> {
        self.registry().clone()
    }

    pub fn device(&self, key: &ChannelKey) -> Option<SharedChannel> {
        self.registry().iter().find(|c| c.key() == *key).cloned()
    }

    fn find(&self, kind: InterfaceType, interface_id: &str) -> Option<SharedChannel> {
        self.registry()
            .iter()
            .find(|c| c.interface_type() == kind && c.interface_id() == interface_id)
            .cloned()
    }

    /// Register `channel` unless an equal one is known. Notifies on insert.
    fn register(&self, channel: SharedChannel) -> Option<SharedChannel> {
        {
            let mut registry = self.registry();
            let key = channel.key();
            if registry.iter().any(|c| c.key() == key) {
                return None;
            }
            registry.push(channel.clone());
        }
        tlog!("[device_manager] Found {} {}", channel.key(), channel.model());
        self.notify_found(&channel);
        Some(channel)
    }

    /// Drop `key` from the registry and disconnect it
    pub async fn remove_device(&self, key: &ChannelKey) -> Option<SharedChannel> {
        let removed = {
            let mut registry = self.registry();
            let pos = registry.iter().position(|c| c.key() == *key)?;
            registry.remove(pos)
        };
        if let Err(e) = removed.disconnect().await {
            tlog!("[device_manager] Disconnecting {} failed: {}", key, e);
        }
        Some(removed)
    }

    /// Drop and disconnect every channel of `kind`
    pub async fn clear_devices(&self, kind: InterfaceType) {
        let removed: Vec<SharedChannel> = {
            let mut registry = self.registry();
            let (gone, kept): (Vec<SharedChannel>, Vec<SharedChannel>) =
                registry.drain(..).partition(|c| c.interface_type() == kind);
            *registry = kept;
            gone
        };
        for channel in removed {
            if let Err(e) = channel.disconnect().await {
                tlog!("[device_manager] Disconnecting {} failed: {}", channel.key(), e);
            }
        }
    }

    // ========================================================================
    // Scanning
    // ========================================================================

    pub async fn is_scanning(&self, kind: InterfaceType) -> bool {
        let tasks = self.inner.tasks.lock().await;
        match kind {
            InterfaceType::Ble => tasks.ble.as_ref().is_some_and(|t| !t.is_finished()),
            InterfaceType::Uart => tasks.uart.as_ref().is_some_and(|s| !s.task.is_finished()),
            InterfaceType::Emulation => false,
        }
    }

    /// Start discovery for the transport of `config`. A scan already running
    /// for that transport is left alone.
    pub async fn start_scan(&self, config: ScanConfiguration) -> Result<(), IoError> {
        match config {
            ScanConfiguration::Emulation(c) => {
                self.scan_emulation(c);
                Ok(())
            }
            ScanConfiguration::Ble(c) => self.start_ble_scan(c).await,
            ScanConfiguration::Uart(c) => self.start_uart_scan(c).await,
        }
    }

    /// Cancel every background scan and wait until they have exited. The
    /// registry is left untouched.
    pub async fn stop_scan(&self) {
        let mut tasks = self.inner.tasks.lock().await;

        if let Some(task) = tasks.ble.take() {
            task.abort();
            let _ = task.await;
            match ble::adapter().await {
                Ok(adapter) => {
                    if let Err(e) = adapter.stop_scan().await {
                        tlog!("[device_manager] Failed to stop BLE scan: {}", e);
                    }
                }
                Err(e) => tlog!("[device_manager] BLE adapter unavailable: {}", e),
            }
            tlog!("[device_manager] BLE scan stopped");
        }

        if let Some(scan) = tasks.uart.take() {
            let _ = scan.cancel.send(true);
            if let Err(e) = scan.task.await {
                tlog!("[device_manager] UART scan task failed: {}", e);
            }
        }
    }

    fn scan_emulation(&self, config: EmulationScanConfig) {
        let devices = if config.devices.is_empty() {
            self.inner.settings.emulated_devices.clone()
        } else {
            config.devices
        };
        let scan_config = ScanConfiguration::Emulation(EmulationScanConfig {
            devices: devices.clone(),
        });
        for device in devices {
            if self.find(InterfaceType::Emulation, &device.interface_id()).is_some() {
                continue;
            }
            let channel = EmulationChannel::with_configuration(device, scan_config.clone());
            self.register(Arc::new(channel));
        }
    }

    // ------------------------------------------------------------------------
    // BLE
    // ------------------------------------------------------------------------

    async fn start_ble_scan(&self, config: BleScanConfig) -> Result<(), IoError> {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.ble.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        self.clear_devices(InterfaceType::Ble).await;
        self.clear_devices(InterfaceType::Emulation).await;

        let adapter = ble::adapter().await?;
        let mut events = adapter.events().await?;
        // Unfiltered: probes are recognised by manufacturer data, not services
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| IoError::ble(format!("failed to start BLE scan: {e}")))?;
        tlog!(
            "[device_manager] BLE scan started (vendor 0x{:04X}, target {:?})",
            self.inner.settings.ble_vendor_code,
            config.target
        );

        let manager = self.clone();
        let vendor_code = self.inner.settings.ble_vendor_code;
        tasks.ble = Some(tokio::spawn(async move {
            let mut seen: HashSet<String> = HashSet::new();
            while let Some(event) = events.next().await {
                let CentralEvent::ManufacturerDataAdvertisement {
                    id,
                    manufacturer_data,
                } = event
                else {
                    continue;
                };
                if !is_probe_advertisement(&manufacturer_data, vendor_code) {
                    continue;
                }
                let peripheral_id = id.to_string();
                if !config.accepts(&peripheral_id) || !seen.insert(peripheral_id.clone()) {
                    continue;
                }
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(p) => p,
                    Err(e) => {
                        tlog!("[device_manager] Lost peripheral {}: {}", peripheral_id, e);
                        seen.remove(&peripheral_id);
                        continue;
                    }
                };
                let adapter = adapter.clone();
                manager.register_ble_sighting(&config, &peripheral_id, move || {
                    Arc::new(PeripheralLink::new(adapter, peripheral)) as Arc<dyn BleLink>
                });
            }
            // stop_scan aborts the task, so reaching this point means the
            // adapter went away underneath the scan
            tlog!("[device_manager] BLE event stream ended");
            manager.notify_exception(&IoError::ble("adapter event stream ended"));
        }));
        Ok(())
    }

    /// Register the peripheral `id` unless it is already known. `link` is
    /// only built for a first sighting.
    fn register_ble_sighting(
        &self,
        config: &BleScanConfig,
        id: &str,
        link: impl FnOnce() -> Arc<dyn BleLink>,
    ) -> Option<SharedChannel> {
        if !config.accepts(id) || self.find(InterfaceType::Ble, id).is_some() {
            return None;
        }
        let channel = BleChannel::new(
            link(),
            config.clone(),
            self.inner.settings.ble_write_retry,
            self.inner.settings.ble_min_mtu,
        );
        self.register(Arc::new(channel))
    }

    // ------------------------------------------------------------------------
    // UART
    // ------------------------------------------------------------------------

    async fn start_uart_scan(&self, config: UartScanConfig) -> Result<(), IoError> {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.uart.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Ok(());
        }

        tlog!(
            "[device_manager] UART scan started on {}",
            config.port_name.as_deref().unwrap_or("all ports")
        );
        let (cancel, cancel_rx) = watch::channel(false);
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let worker = manager.clone().uart_scan_loop(config, cancel_rx);
            if let Err(panic) = AssertUnwindSafe(worker).catch_unwind().await {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tlog!("[device_manager] UART scan worker panicked: {}", message);
                manager.notify_exception(&IoError::protocol("uart scan", message));
            }
        });
        tasks.uart = Some(UartScan { cancel, task });
        Ok(())
    }

    async fn uart_scan_loop(self, config: UartScanConfig, mut cancel: watch::Receiver<bool>) {
        let mut probe: Option<Arc<UartChannel>> = None;
        loop {
            if cancelled(&cancel) {
                break;
            }
            if let Err(e) = self.uart_pass(&config, &mut probe, &cancel).await {
                tlog!("[device_manager] UART scan aborted: {}", e);
                self.notify_exception(&e);
                break;
            }
            if cancelled(&cancel) {
                break;
            }
            // Sender gone means the manager was dropped
            if let Ok(Err(_)) =
                tokio::time::timeout(self.inner.settings.uart_poll_interval, cancel.changed()).await
            {
                break;
            }
        }
        if let Some(probe) = probe {
            let _ = probe.disconnect().await;
        }
        tlog!("[device_manager] UART scan stopped");
    }

    /// Line configurations to try, in order
    fn uart_candidates(&self, config: &UartScanConfig, ports: &[PortDescriptor]) -> Vec<UartScanConfig> {
        if config.port_name.is_some() {
            return vec![config.clone()];
        }
        ports
            .iter()
            .flat_map(|port| {
                self.inner
                    .settings
                    .uart_candidates
                    .iter()
                    .map(move |settings| UartScanConfig::for_port(port.port_name.clone(), settings.clone()))
            })
            .collect()
    }

    /// One walk over every candidate configuration
    async fn uart_pass(
        &self,
        config: &UartScanConfig,
        probe: &mut Option<Arc<UartChannel>>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), IoError> {
        let ports = match self.inner.pool.list_ports() {
            Ok(ports) => ports,
            // A fixed port does not need the enumeration
            Err(e) if config.port_name.is_some() => {
                tlog!("[device_manager] Port enumeration failed: {}", e);
                Vec::new()
            }
            Err(e) if e.is_local() => {
                tlog!("[device_manager] Port enumeration failed: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for candidate in self.uart_candidates(config, &ports) {
            if cancelled(cancel) {
                return Ok(());
            }
            let uni = ports
                .iter()
                .find(|p| candidate.port_name.as_deref() == Some(p.port_name.as_str()))
                .is_some_and(|p| is_uni_adapter(&p.friendly_name, &self.inner.settings.adapter_names));

            match self.discover_candidate(probe, &candidate, uni, cancel).await {
                Ok(0) => {}
                Ok(found) => tlog!(
                    "[device_manager] {} new device(s) on {}",
                    found,
                    ScanConfiguration::Uart(candidate.clone())
                ),
                Err(e) if e.is_local() => tlog!(
                    "[device_manager] Skipping {}: {}",
                    ScanConfiguration::Uart(candidate.clone()),
                    e
                ),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Discover every probe answering on one port/line configuration.
    /// Returns how many new devices were registered.
    async fn discover_candidate(
        &self,
        probe: &mut Option<Arc<UartChannel>>,
        candidate: &UartScanConfig,
        uni: bool,
        cancel: &watch::Receiver<bool>,
    ) -> Result<usize, IoError> {
        let settings = &self.inner.settings;
        let channel = match probe {
            Some(channel) => {
                channel.set_uni_adapter(uni);
                channel
                    .set_scan_configuration(ScanConfiguration::Uart(candidate.clone()))
                    .await?;
                channel.clone()
            }
            None => {
                let channel = Arc::new(UartChannel::new(
                    self.inner.pool.clone(),
                    candidate.clone(),
                    BROADCAST,
                    uni,
                )?);
                *probe = Some(channel.clone());
                channel.ensure_connection().await?;
                channel
            }
        };

        tokio::time::sleep(settings.bus_silence).await;

        let exec = CommandExecutor::new(channel.clone()).with_timeout(settings.discovery_timeout);
        let mut empty_attempts = 0;
        let mut found = 0;
        while empty_attempts < settings.empty_attempt_limit {
            if cancelled(cancel) {
                break;
            }
            let session = new_session_id();
            let response = exec
                .execute_to(BROADCAST, &DiscoveryParameter::broadcast(session))
                .await;
            match response.code {
                ResultCode::Success => {}
                ResultCode::NotConnected | ResultCode::TransportError => {
                    return Err(IoError::connection(
                        channel.port_name(),
                        format!("discovery failed: {}", response.code),
                    ));
                }
                _ => {
                    empty_attempts += 1;
                    continue;
                }
            }

            let mut new_devices = 0;
            for device in &response.result.devices {
                if device.bus_address == BROADCAST {
                    continue;
                }
                if self.register_uart_device(candidate, uni, device)?.is_some() {
                    new_devices += 1;
                }

                // Muted probes stay quiet so the next broadcast surfaces another one
                tokio::time::sleep(settings.ack_delay).await;
                let ack = DiscoveryAckParameter {
                    target_address: device.bus_address,
                    session_id: session,
                };
                let ack_response = exec.execute_to(device.bus_address, &ack).await;
                if !ack_response.is_success() {
                    tlog!(
                        "[device_manager] DiscoveryAck to {} failed: {}",
                        device.bus_address,
                        ack_response.code
                    );
                }
            }

            if new_devices == 0 {
                empty_attempts += 1;
            } else {
                empty_attempts = 0;
                found += new_devices;
            }
        }
        Ok(found)
    }

    fn register_uart_device(
        &self,
        config: &UartScanConfig,
        uni: bool,
        device: &AnnouncedDevice,
    ) -> Result<Option<SharedChannel>, IoError> {
        let channel = UartChannel::new(self.inner.pool.clone(), config.clone(), device.bus_address, uni)?;
        channel.set_model(&device.model);
        Ok(self.register(Arc::new(channel)))
    }

    // ========================================================================
    // Direct lookup
    // ========================================================================

    /// Find (or reach directly) the probe at `bus_address` without a
    /// background scan.
    ///
    /// UART: a registered device is revived with two short addressed
    /// Discovery calls whose outcome is ignored, then returned. An unknown
    /// address is probed once and registered when it answers.
    /// Emulation: the registered channel with that address, or a new one.
    pub async fn try_get_device(
        &self,
        config: &ScanConfiguration,
        bus_address: u8,
    ) -> Result<Option<SharedChannel>, IoError> {
        match config {
            ScanConfiguration::Uart(uart) => self.try_get_uart_device(uart, bus_address).await,
            ScanConfiguration::Emulation(emulation) => {
                Ok(Some(self.try_get_emulated_device(emulation, bus_address)))
            }
            other => Err(IoError::invalid_argument(format!(
                "direct lookup is not available for {} configurations",
                other.interface_type()
            ))),
        }
    }

    async fn try_get_uart_device(
        &self,
        config: &UartScanConfig,
        bus_address: u8,
    ) -> Result<Option<SharedChannel>, IoError> {
        if bus_address == BROADCAST {
            return Err(IoError::invalid_argument("UART lookup needs a non-zero bus address"));
        }
        let port_name = config
            .port_name
            .as_deref()
            .ok_or_else(|| IoError::invalid_argument("UART lookup needs a port name"))?;
        let settings = &self.inner.settings;

        let interface_id = format!("{}#{}", port_name, bus_address);
        if let Some(channel) = self.find(InterfaceType::Uart, &interface_id) {
            // A probe left in another protocol mode needs a few frames to resync
            for timeout in settings.revive_timeouts() {
                let exec = CommandExecutor::new(channel.clone()).with_timeout(timeout);
                let response = exec
                    .execute(&DiscoveryParameter::addressed(bus_address, new_session_id()))
                    .await;
                tlog!(
                    "[device_manager] Revive {}: {}",
                    channel.interface_id(),
                    response.code
                );
            }
            return Ok(Some(channel));
        }

        let uni = self
            .inner
            .pool
            .list_ports()
            .unwrap_or_default()
            .iter()
            .find(|p| p.port_name == port_name)
            .is_some_and(|p| is_uni_adapter(&p.friendly_name, &settings.adapter_names));
        let channel: SharedChannel = Arc::new(UartChannel::new(
            self.inner.pool.clone(),
            config.clone(),
            bus_address,
            uni,
        )?);

        let exec = CommandExecutor::new(channel.clone()).with_timeout(settings.discovery_timeout);
        let response = exec
            .execute(&DiscoveryParameter::addressed(bus_address, new_session_id()))
            .await;
        let announced = response
            .result
            .devices
            .iter()
            .find(|d| d.bus_address == bus_address);
        match announced {
            Some(device) if response.is_success() => {
                channel.set_model(&device.model);
                Ok(Some(self.register(channel.clone()).unwrap_or(channel)))
            }
            _ => {
                tlog!(
                    "[device_manager] No probe at {}: {}",
                    interface_id,
                    response.code
                );
                let _ = channel.disconnect().await;
                Ok(None)
            }
        }
    }

    fn try_get_emulated_device(&self, config: &EmulationScanConfig, bus_address: u8) -> SharedChannel {
        let existing = self
            .registry()
            .iter()
            .find(|c| c.interface_type() == InterfaceType::Emulation && c.bus_address() == bus_address)
            .cloned();
        if let Some(channel) = existing {
            return channel;
        }
        let settings = config
            .devices
            .iter()
            .chain(self.inner.settings.emulated_devices.iter())
            .find(|d| d.bus_address == bus_address)
            .cloned()
            .unwrap_or_else(|| EmulatedDeviceSettings::new(bus_address, "EE31 Emulated"));
        Arc::new(EmulationChannel::with_configuration(
            settings,
            ScanConfiguration::Emulation(config.clone()),
        ))
    }
}
