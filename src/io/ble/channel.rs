// src/io/ble/channel.rs
//
// Channel to one probe over BLE.
//
// Connection sequence: stop scanning, connect, ask for the minimum MTU
// (logged, not fatal, when the stack cannot negotiate), discover services,
// subscribe to Rx, then prime the link with one low-intensity Discovery.
// Writes are retried according to the channel's `RetryPolicy`.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::link::{BleLink, RxQueue};
use crate::ee31::commands::discovery::{new_session_id, DiscoveryParameter};
use crate::ee31::commands::CommandParameter;
use crate::ee31::frame::{constants::BROADCAST, Frame};
use crate::io::{
    remember_configuration, BleScanConfig, Channel, InterfaceType, IoError, ScanConfiguration,
};
use crate::settings::RetryPolicy;

struct BleState {
    connected: bool,
    model: String,
    config: ScanConfiguration,
    used: Vec<ScanConfiguration>,
}

pub struct BleChannel {
    link: Arc<dyn BleLink>,
    retry: RetryPolicy,
    min_mtu: u16,
    rx: RxQueue,
    io_lock: tokio::sync::Mutex<()>,
    state: Mutex<BleState>,
}

impl BleChannel {
    pub fn new(link: Arc<dyn BleLink>, config: BleScanConfig, retry: RetryPolicy, min_mtu: u16) -> Self {
        let config = ScanConfiguration::Ble(config);
        Self {
            link,
            retry,
            min_mtu,
            rx: Arc::new(Mutex::new(VecDeque::new())),
            io_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(BleState {
                connected: false,
                model: String::new(),
                used: vec![config.clone()],
                config,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn rx(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn write_with_retry(&self, data: &[u8]) -> Result<(), IoError> {
        let mut attempt = 0;
        loop {
            match self.link.write_tx(data).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    tlog!(
                        "[ble] Write to {} failed ({}), retry {}/{}",
                        self.link.id(),
                        e,
                        attempt,
                        self.retry.max_retries
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect_locked(&self) -> Result<(), IoError> {
        if self.lock().connected {
            return Ok(());
        }
        let id = self.link.id();

        self.link.connect().await?;

        match self.link.request_mtu(self.min_mtu).await {
            Ok(mtu) if mtu < self.min_mtu => {
                tlog!("[ble] {}: negotiated MTU {} is below {}", id, mtu, self.min_mtu)
            }
            Ok(_) => {}
            Err(e) => tlog!("[ble] {}: could not request MTU {}: {}", id, self.min_mtu, e),
        }

        let setup = async {
            self.link.discover_services().await?;
            self.rx().clear();
            self.link.subscribe_rx(self.rx.clone()).await
        };
        if let Err(e) = setup.await {
            tlog!("[ble] {}: connection setup failed: {}", id, e);
            let _ = self.link.disconnect().await;
            return Err(e);
        }

        self.lock().connected = true;
        tlog!("[ble] Connected to {}", id);

        // Keep-alive so the probe does not drop the fresh link
        let prime = DiscoveryParameter::low_intensity(new_session_id());
        match Frame::new(BROADCAST, prime.opcode(), prime.to_payload()).encode() {
            Ok(bytes) => {
                if let Err(e) = self.write_with_retry(&bytes).await {
                    tlog!("[ble] {}: priming discovery failed: {}", id, e);
                }
            }
            Err(e) => tlog!("[ble] {}: cannot encode priming discovery: {}", id, e),
        }
        Ok(())
    }

    async fn disconnect_locked(&self) -> Result<(), IoError> {
        let was_connected = std::mem::replace(&mut self.lock().connected, false);
        self.rx().clear();
        if was_connected {
            self.link.disconnect().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for BleChannel {
    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Ble
    }

    fn interface_id(&self) -> String {
        self.link.id()
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
        self.rx().len()
    }

    fn scan_configuration(&self) -> ScanConfiguration {
        self.lock().config.clone()
    }

    fn used_configurations(&self) -> Vec<ScanConfiguration> {
        self.lock().used.clone()
    }

    async fn set_scan_configuration(&self, config: ScanConfiguration) -> Result<(), IoError> {
        if config.interface_type() != InterfaceType::Ble {
            return Err(IoError::invalid_argument(format!(
                "BLE channel cannot use {} configuration",
                config.interface_type()
            )));
        }
        let _io = self.io_lock.lock().await;
        self.disconnect_locked().await?;
        {
            let mut state = self.lock();
            remember_configuration(&mut state.used, &config);
            state.config = config;
        }
        self.connect_locked().await
    }

    async fn ensure_connection(&self) -> Result<(), IoError> {
        let _io = self.io_lock.lock().await;
        self.connect_locked().await
    }

    async fn disconnect(&self) -> Result<(), IoError> {
        let _io = self.io_lock.lock().await;
        self.disconnect_locked().await
    }

    async fn read_bytes(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        if !self.is_connected() {
            return Err(IoError::NotConnected(self.link.id()));
        }
        let mut rx = self.rx();
        let n = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn write_bytes(&self, data: &[u8]) -> Result<(), IoError> {
        let _io = self.io_lock.lock().await;
        if !self.is_connected() {
            return Err(IoError::NotConnected(self.link.id()));
        }
        self.write_with_retry(data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ee31::commands::ProbeIdentityGetParameter;
    use crate::ee31::frame::FrameParser;
    use crate::ee31::{CommandExecutor, ResultCode};
    use crate::io::emulation::{EmulatedDeviceSettings, EmulatedProbe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory peripheral wrapping an emulated probe
    struct FakeLink {
        probe: Mutex<EmulatedProbe>,
        parser: Mutex<FrameParser>,
        rx: Mutex<Option<RxQueue>>,
        fail_writes: AtomicUsize,
        writes: AtomicUsize,
        mtu: Option<u16>,
        has_service: bool,
    }

    impl FakeLink {
        fn new() -> Self {
            Self {
                probe: Mutex::new(EmulatedProbe::new(EmulatedDeviceSettings::new(1, "HTP501"))),
                parser: Mutex::new(FrameParser::new()),
                rx: Mutex::new(None),
                fail_writes: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                mtu: Some(256),
                has_service: true,
            }
        }
    }

    #[async_trait]
    impl BleLink for FakeLink {
        fn id(&self) -> String {
            "AA:BB:CC:DD:EE:01".to_string()
        }
        async fn connect(&self) -> Result<(), IoError> {
            Ok(())
        }
        async fn request_mtu(&self, _mtu: u16) -> Result<u16, IoError> {
            self.mtu.ok_or_else(|| IoError::Unsupported("mtu".to_string()))
        }
        async fn discover_services(&self) -> Result<(), IoError> {
            if self.has_service {
                Ok(())
            } else {
                Err(IoError::connection(self.id(), "EE31 service not present"))
            }
        }
        async fn subscribe_rx(&self, rx: RxQueue) -> Result<(), IoError> {
            *self.rx.lock().unwrap() = Some(rx);
            Ok(())
        }
        async fn write_tx(&self, data: &[u8]) -> Result<(), IoError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) > 0 {
                self.fail_writes.fetch_sub(1, Ordering::SeqCst);
                return Err(IoError::ble("write failed"));
            }
            let frames = self.parser.lock().unwrap().feed(data);
            for frame in frames {
                if let Some(resp) = self.probe.lock().unwrap().handle(&frame) {
                    if let Some(rx) = self.rx.lock().unwrap().as_ref() {
                        rx.lock().unwrap().extend(resp.encode().unwrap());
                    }
                }
            }
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), IoError> {
            Ok(())
        }
    }

    fn channel(link: FakeLink, retry: RetryPolicy) -> (Arc<FakeLink>, Arc<BleChannel>) {
        let link = Arc::new(link);
        let ch = Arc::new(BleChannel::new(link.clone(), BleScanConfig::default(), retry, 256));
        (link, ch)
    }

    #[tokio::test]
    async fn test_connect_primes_link() {
        let (link, ch) = channel(FakeLink::new(), RetryPolicy::production());
        ch.ensure_connection().await.unwrap();
        assert!(ch.is_connected());
        assert_eq!(link.writes.load(Ordering::SeqCst), 1);
        // priming discovery answered
        assert!(ch.bytes_to_read() > 0);
        assert_eq!(ch.bytes_to_write(), 0);
        assert_eq!(ch.interface_id(), "AA:BB:CC:DD:EE:01");
    }

    #[tokio::test]
    async fn test_missing_mtu_is_not_fatal() {
        let mut fake = FakeLink::new();
        fake.mtu = None;
        let (_, ch) = channel(fake, RetryPolicy::production());
        ch.ensure_connection().await.unwrap();
        assert!(ch.is_connected());
    }

    #[tokio::test]
    async fn test_missing_service_leaves_disconnected() {
        let mut fake = FakeLink::new();
        fake.has_service = false;
        let (_, ch) = channel(fake, RetryPolicy::production());
        assert!(ch.ensure_connection().await.is_err());
        assert!(!ch.is_connected());
        let mut buf = [0u8; 4];
        assert!(ch.read_bytes(&mut buf).await.is_err());

        let exec = CommandExecutor::new(ch.clone()).with_timeout(Duration::from_millis(20));
        let resp = exec.execute(&ProbeIdentityGetParameter).await;
        assert_eq!(resp.code, ResultCode::NotConnected);
    }

    #[tokio::test]
    async fn test_write_retries_then_succeeds() {
        let (link, ch) = channel(FakeLink::new(), RetryPolicy::production());
        ch.ensure_connection().await.unwrap();
        link.fail_writes.store(2, Ordering::SeqCst);
        let before = link.writes.load(Ordering::SeqCst);
        ch.write_bytes(&[0x00]).await.unwrap();
        assert_eq!(link.writes.load(Ordering::SeqCst) - before, 3);
    }

    #[tokio::test]
    async fn test_stress_policy_fails_fast() {
        let (link, ch) = channel(FakeLink::new(), RetryPolicy::stress());
        ch.ensure_connection().await.unwrap();
        link.fail_writes.store(1, Ordering::SeqCst);
        let before = link.writes.load(Ordering::SeqCst);
        assert!(ch.write_bytes(&[0x00]).await.is_err());
        assert_eq!(link.writes.load(Ordering::SeqCst) - before, 1);
    }

    #[tokio::test]
    async fn test_command_over_ble() {
        let (_, ch) = channel(FakeLink::new(), RetryPolicy::production());
        let exec = CommandExecutor::new(ch.clone());
        let resp = exec.execute(&ProbeIdentityGetParameter).await;
        assert_eq!(resp.code, ResultCode::Success);
        assert_eq!(resp.result.identity.name, "HTP501");
    }

    #[tokio::test]
    async fn test_reconfigure_keeps_history() {
        let (_, ch) = channel(FakeLink::new(), RetryPolicy::production());
        let target = ScanConfiguration::Ble(BleScanConfig::with_target("AA:BB:CC:DD:EE:01"));
        ch.set_scan_configuration(target.clone()).await.unwrap();
        assert_eq!(ch.scan_configuration(), target);
        assert_eq!(ch.used_configurations().len(), 2);
        assert!(ch.is_connected());
    }
}
