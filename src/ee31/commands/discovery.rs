// src/ee31/commands/discovery.rs
//
// Discovery and DiscoveryAck.
//
// Discovery request:  [Session-2bytes-LE][Target-1byte][MaxDevices-1byte][DelayMs-2bytes-LE][Inquiry-1byte]
// Discovery response: [Session-2bytes-LE][Count-1byte] + Count x [BusAddr-1byte][Model-16bytes]
// Ack request:        [Target-1byte][Session-2bytes-LE]
// Ack response:       [BusAddr-1byte]

use rand::Rng;
use serde::Serialize;

use super::{CommandParameter, CommandResult};
use crate::ee31::convert::BinaryConverter;
use crate::ee31::frame::{constants::BROADCAST, Opcode};

/// Length of the model text field of an announcement
pub const MODEL_LEN: usize = 16;
const ANNOUNCEMENT_LEN: usize = 1 + MODEL_LEN;

/// Regular discovery inquiry
pub const INQUIRY_STANDARD: u8 = 0x00;
/// Keep-alive inquiry: the probe answers without scanning its sub-bus
pub const INQUIRY_LOW_INTENSITY: u8 = 0x01;

/// Fresh random non-zero discovery session id
pub fn new_session_id() -> u16 {
    rand::rng().random_range(1..=u16::MAX)
}

// ============================================================================
// Discovery
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryParameter {
    pub session_id: u16,
    /// 0 = broadcast
    pub target_address: u8,
    pub max_devices: u8,
    /// Per-device response delay in milliseconds
    pub response_delay_ms: u16,
    pub inquiry: u8,
}

impl DiscoveryParameter {
    pub fn broadcast(session_id: u16) -> Self {
        Self {
            session_id,
            target_address: BROADCAST,
            max_devices: 1,
            response_delay_ms: 0,
            inquiry: INQUIRY_STANDARD,
        }
    }

    pub fn addressed(target_address: u8, session_id: u16) -> Self {
        Self {
            target_address,
            ..Self::broadcast(session_id)
        }
    }

    /// Single-device keep-alive used to prime a fresh link
    pub fn low_intensity(session_id: u16) -> Self {
        Self {
            inquiry: INQUIRY_LOW_INTENSITY,
            ..Self::broadcast(session_id)
        }
    }
}

impl CommandParameter for DiscoveryParameter {
    type Result = DiscoveryResult;

    fn opcode(&self) -> Opcode {
        Opcode::Discovery
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let c = BinaryConverter::LE;
        c.put_u16(out, self.session_id);
        out.push(self.target_address);
        out.push(self.max_devices);
        c.put_u16(out, self.response_delay_ms);
        out.push(self.inquiry);
    }

    fn matches_response(&self, payload: &[u8]) -> bool {
        payload.len() < 2 || BinaryConverter::LE.to_u16(payload, 0) == self.session_id
    }
}

/// One device announced in a discovery response
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AnnouncedDevice {
    pub bus_address: u8,
    pub model: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryResult {
    pub session_id: u16,
    pub devices: Vec<AnnouncedDevice>,
}

impl DiscoveryResult {
    /// Encode a response payload (used by the emulation)
    pub fn encode(&self, out: &mut Vec<u8>) {
        let c = BinaryConverter::LE;
        c.put_u16(out, self.session_id);
        out.push(self.devices.len() as u8);
        for d in &self.devices {
            out.push(d.bus_address);
            c.put_cstring(out, &d.model, MODEL_LEN);
        }
    }
}

impl CommandResult for DiscoveryResult {
    const MIN_LEN: usize = 3;

    fn decode(payload: &[u8]) -> Option<Self> {
        let c = BinaryConverter::LE;
        let count = c.to_u8(payload, 2) as usize;
        if payload.len() < Self::MIN_LEN + count * ANNOUNCEMENT_LEN {
            return None;
        }
        let devices = (0..count)
            .map(|i| {
                let base = Self::MIN_LEN + i * ANNOUNCEMENT_LEN;
                AnnouncedDevice {
                    bus_address: c.to_u8(payload, base),
                    model: c.to_cstring(payload, base + 1, MODEL_LEN),
                }
            })
            .collect();
        Some(DiscoveryResult {
            session_id: c.to_u16(payload, 0),
            devices,
        })
    }
}

// ============================================================================
// DiscoveryAck
// ============================================================================

/// Mutes the probe at `target_address` that answered `session_id`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryAckParameter {
    pub target_address: u8,
    pub session_id: u16,
}

impl CommandParameter for DiscoveryAckParameter {
    type Result = DiscoveryAckResult;

    fn opcode(&self) -> Opcode {
        Opcode::DiscoveryAck
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.target_address);
        BinaryConverter::LE.put_u16(out, self.session_id);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryAckResult {
    pub bus_address: u8,
}

impl CommandResult for DiscoveryAckResult {
    const MIN_LEN: usize = 1;

    fn decode(payload: &[u8]) -> Option<Self> {
        Some(DiscoveryAckResult {
            bus_address: payload[0],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ee31::commands::ResultCode;

    #[test]
    fn test_discovery_request_layout() {
        let p = DiscoveryParameter {
            session_id: 0xBEEF,
            target_address: 0,
            max_devices: 4,
            response_delay_ms: 20,
            inquiry: INQUIRY_STANDARD,
        };
        assert_eq!(p.to_payload(), vec![0xEF, 0xBE, 0x00, 0x04, 0x14, 0x00, 0x00]);
        assert_eq!(p.opcode(), Opcode::Discovery);
    }

    #[test]
    fn test_discovery_response_decode() {
        let mut payload = vec![0x34, 0x12, 0x02];
        payload.push(5);
        payload.extend_from_slice(b"EE210\0\0\0\0\0\0\0\0\0\0\0");
        payload.push(9);
        payload.extend_from_slice(b"EE07");
        payload.extend_from_slice(&[0xFF; 12]);

        let (code, r) = DiscoveryResult::interpret(&payload);
        assert_eq!(code, ResultCode::Success);
        assert_eq!(r.session_id, 0x1234);
        assert_eq!(
            r.devices,
            vec![
                AnnouncedDevice { bus_address: 5, model: "EE210".to_string() },
                AnnouncedDevice { bus_address: 9, model: "EE07".to_string() },
            ]
        );
    }

    #[test]
    fn test_discovery_response_truncated() {
        // count says 1 announcement, but only half of it is present
        let payload = vec![0x34, 0x12, 0x01, 0x05, b'E', b'E'];
        let (code, r) = DiscoveryResult::interpret(&payload);
        assert_eq!(code, ResultCode::InvalidResult);
        assert_eq!(r, DiscoveryResult::default());

        let (code, _) = DiscoveryResult::interpret(&[0x34]);
        assert_eq!(code, ResultCode::InvalidResult);
    }

    #[test]
    fn test_discovery_session_filter() {
        let p = DiscoveryParameter::broadcast(0x1234);
        assert!(p.matches_response(&[0x34, 0x12, 0x00]));
        assert!(!p.matches_response(&[0x35, 0x12, 0x00]));
    }

    #[test]
    fn test_result_encode_matches_decode() {
        let result = DiscoveryResult {
            session_id: 77,
            devices: vec![AnnouncedDevice { bus_address: 3, model: "HTP501".to_string() }],
        };
        let mut payload = Vec::new();
        result.encode(&mut payload);
        assert_eq!(payload.len(), 3 + 17);
        assert_eq!(DiscoveryResult::interpret(&payload).1, result);
    }

    #[test]
    fn test_ack_layout() {
        let p = DiscoveryAckParameter { target_address: 12, session_id: 0x0102 };
        assert_eq!(p.to_payload(), vec![12, 0x02, 0x01]);
        assert_eq!(DiscoveryAckResult::interpret(&[12]).1.bus_address, 12);
        assert_eq!(DiscoveryAckResult::interpret(&[]).0, ResultCode::InvalidResult);
    }

    #[test]
    fn test_session_ids_non_zero() {
        for _ in 0..1000 {
            assert_ne!(new_session_id(), 0);
        }
    }
}
