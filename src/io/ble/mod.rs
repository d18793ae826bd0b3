// src/io/ble/mod.rs
//
// Bluetooth Low Energy transport.
//
// One shared btleplug manager/adapter serves scanning and every connection.
// EE31 probes expose one GATT service with a write-without-response Tx
// characteristic (host to probe) and a notify Rx characteristic (probe to
// host).

mod channel;
mod link;

pub use channel::BleChannel;
pub use link::{BleLink, PeripheralLink, RxQueue};

use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::io::IoError;

// ============================================================================
// Constants
// ============================================================================

/// EE31 GATT service
pub const EE31_SERVICE_UUID: Uuid =
    uuid_from_fields(0x6E400001, 0xE5E1, 0x4A31, 0x9B1C, 0xD1EE31000001);

/// Host to probe, write without response
pub const TX_CHAR_UUID: Uuid =
    uuid_from_fields(0x6E400002, 0xE5E1, 0x4A31, 0x9B1C, 0xD1EE31000001);

/// Probe to host, notify
pub const RX_CHAR_UUID: Uuid =
    uuid_from_fields(0x6E400003, 0xE5E1, 0x4A31, 0x9B1C, 0xD1EE31000001);

// ============================================================================
// Shared adapter state
// ============================================================================

struct BleAdapterState {
    manager: Option<Manager>,
    adapter: Option<Adapter>,
}

static BLE_ADAPTER: Lazy<Arc<Mutex<BleAdapterState>>> = Lazy::new(|| {
    Arc::new(Mutex::new(BleAdapterState {
        manager: None,
        adapter: None,
    }))
});

/// Shared adapter, initialising the BLE manager on first use.
pub async fn adapter() -> Result<Adapter, IoError> {
    let mut state = BLE_ADAPTER.lock().await;
    if let Some(adapter) = &state.adapter {
        return Ok(adapter.clone());
    }
    let manager = Manager::new()
        .await
        .map_err(|e| IoError::ble(format!("BLE manager init failed: {e}")))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| IoError::ble(format!("failed to list BLE adapters: {e}")))?;
    let adapter = adapters
        .into_iter()
        .next()
        .ok_or_else(|| IoError::ble("no BLE adapter found"))?;
    state.adapter = Some(adapter.clone());
    state.manager = Some(manager);
    Ok(adapter)
}

// ============================================================================
// Helpers
// ============================================================================

/// Build a 128-bit UUID from the 5-field encoding used by Zephyr's
/// BT_UUID_128_ENCODE macro.
pub const fn uuid_from_fields(a: u32, b: u16, c: u16, d: u16, e: u64) -> Uuid {
    let hi: u64 = (a as u64) << 32 | (b as u64) << 16 | c as u64;
    let lo: u64 = (d as u64) << 48 | e;
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

/// Whether manufacturer data identifies an EE31 probe: either the company
/// key or the leading 16-bit hardware code (little-endian) equals
/// `vendor_code`.
pub fn is_probe_advertisement(manufacturer_data: &HashMap<u16, Vec<u8>>, vendor_code: u16) -> bool {
    manufacturer_data.iter().any(|(company, data)| {
        *company == vendor_code
            || (data.len() >= 2 && u16::from_le_bytes([data[0], data[1]]) == vendor_code)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_from_fields() {
        assert_eq!(
            EE31_SERVICE_UUID.to_string(),
            "6e400001-e5e1-4a31-9b1c-d1ee31000001"
        );
        assert_ne!(TX_CHAR_UUID, RX_CHAR_UUID);
    }

    #[test]
    fn test_vendor_filter() {
        let mut data = HashMap::new();
        data.insert(0x1CD1u16, vec![0x01]);
        assert!(is_probe_advertisement(&data, 0x1CD1));

        let mut data = HashMap::new();
        data.insert(0x0059u16, vec![0xD1, 0x1C, 0x00]);
        assert!(is_probe_advertisement(&data, 0x1CD1));

        let mut data = HashMap::new();
        data.insert(0x0059u16, vec![0x1C, 0xD1]);
        assert!(!is_probe_advertisement(&data, 0x1CD1));
        assert!(!is_probe_advertisement(&HashMap::new(), 0x1CD1));
    }
}
