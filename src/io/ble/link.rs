// src/io/ble/link.rs
//
// GATT-level link to one peripheral. `BleChannel` drives the connection
// sequence through this seam; `PeripheralLink` implements it with btleplug.

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use super::{EE31_SERVICE_UUID, RX_CHAR_UUID, TX_CHAR_UUID};
use crate::io::IoError;

/// Inbound byte FIFO fed by Rx notifications
pub type RxQueue = Arc<Mutex<VecDeque<u8>>>;

#[async_trait]
pub trait BleLink: Send + Sync {
    /// Peripheral id
    fn id(&self) -> String;

    async fn connect(&self) -> Result<(), IoError>;

    /// Ask for at least `mtu` bytes; returns the negotiated value
    async fn request_mtu(&self, mtu: u16) -> Result<u16, IoError>;

    /// Discover services and check the EE31 service is present
    async fn discover_services(&self) -> Result<(), IoError>;

    /// Enable Rx notifications, appending every notification to `rx`
    async fn subscribe_rx(&self, rx: RxQueue) -> Result<(), IoError>;

    async fn write_tx(&self, data: &[u8]) -> Result<(), IoError>;

    async fn disconnect(&self) -> Result<(), IoError>;
}

pub struct PeripheralLink {
    adapter: Adapter,
    peripheral: Peripheral,
    notify_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeripheralLink {
    pub fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        Self {
            adapter,
            peripheral,
            notify_task: Mutex::new(None),
        }
    }

    fn characteristic(&self, uuid: uuid::Uuid) -> Result<Characteristic, IoError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| IoError::connection(self.id(), format!("characteristic {} not found", uuid)))
    }

    fn stop_notify_task(&self) {
        let task = self
            .notify_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[async_trait]
impl BleLink for PeripheralLink {
    fn id(&self) -> String {
        self.peripheral.id().to_string()
    }

    async fn connect(&self) -> Result<(), IoError> {
        // Connecting while the adapter scans is unreliable on several stacks
        if let Err(e) = self.adapter.stop_scan().await {
            tlog!("[ble] Failed to stop scan before connecting: {e}");
        }
        if self.peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        tlog!("[ble] Connecting to {}...", self.id());
        self.peripheral
            .connect()
            .await
            .map_err(|e| IoError::connection(self.id(), format!("failed to connect: {e}")))
    }

    async fn request_mtu(&self, _mtu: u16) -> Result<u16, IoError> {
        // btleplug negotiates the MTU inside the platform stack
        Err(IoError::Unsupported(
            "MTU negotiation is not exposed by the BLE backend".to_string(),
        ))
    }

    async fn discover_services(&self) -> Result<(), IoError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| IoError::connection(self.id(), format!("failed to discover services: {e}")))?;

        let has_service = self
            .peripheral
            .services()
            .iter()
            .any(|s| s.uuid == EE31_SERVICE_UUID);
        if !has_service {
            return Err(IoError::connection(self.id(), "EE31 service not present"));
        }
        Ok(())
    }

    async fn subscribe_rx(&self, rx: RxQueue) -> Result<(), IoError> {
        let rx_char = self.characteristic(RX_CHAR_UUID)?;
        self.peripheral.subscribe(&rx_char).await?;

        let mut stream = self.peripheral.notifications().await?;
        let id = self.id();
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != RX_CHAR_UUID {
                    continue;
                }
                let mut queue = rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                queue.extend(notification.value);
            }
            tlog!("[ble] Notification stream of {} ended", id);
        });

        self.stop_notify_task();
        *self
            .notify_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
        Ok(())
    }

    async fn write_tx(&self, data: &[u8]) -> Result<(), IoError> {
        let tx_char = self.characteristic(TX_CHAR_UUID)?;
        self.peripheral
            .write(&tx_char, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), IoError> {
        self.stop_notify_task();
        if self.peripheral.is_connected().await.unwrap_or(false) {
            tlog!("[ble] Disconnecting from {}", self.id());
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
