// src/ee31/commands/probe.rs
//
// Probe identity / calibration record.
//
// Record (24 bytes):
//   [BusAddr-1][IsEE-1][Name-16][CalDay-1][CalMonth-1][CalYear-2-LE][Retries-1][Timeout10ms-1]

use chrono::NaiveDate;
use serde::Serialize;
use std::time::Duration;

use super::{CommandParameter, CommandResult, StatusResult};
use crate::ee31::convert::BinaryConverter;
use crate::ee31::frame::Opcode;

pub const NAME_LEN: usize = 16;
pub const RECORD_LEN: usize = 24;

const TIMEOUT_UNIT_MS: u64 = 10;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProbeIdentity {
    pub bus_address: u8,
    /// E+E-branded probe
    pub is_ee_probe: bool,
    pub name: String,
    pub calib_expiration: Option<NaiveDate>,
    /// Retry override, 0 = firmware default
    pub retries: u8,
    /// Timeout override, 0 = firmware default
    pub timeout: Duration,
}

impl ProbeIdentity {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let c = BinaryConverter::LE;
        out.push(self.bus_address);
        out.push(self.is_ee_probe as u8);
        c.put_cstring(out, &self.name, NAME_LEN);
        c.put_date(out, self.calib_expiration);
        out.push(self.retries);
        let units = (self.timeout.as_millis() as u64 / TIMEOUT_UNIT_MS).min(u8::MAX as u64);
        out.push(units as u8);
    }

    pub fn decode(payload: &[u8]) -> Self {
        let c = BinaryConverter::LE;
        ProbeIdentity {
            bus_address: c.to_u8(payload, 0),
            is_ee_probe: c.to_u8(payload, 1) != 0,
            name: c.to_cstring(payload, 2, NAME_LEN),
            calib_expiration: c.to_date(payload, 18),
            retries: c.to_u8(payload, 22),
            timeout: Duration::from_millis(c.to_u8(payload, 23) as u64 * TIMEOUT_UNIT_MS),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeIdentityGetParameter;

impl CommandParameter for ProbeIdentityGetParameter {
    type Result = ProbeIdentityResult;

    fn opcode(&self) -> Opcode {
        Opcode::ProbeIdentityGet
    }

    fn encode(&self, _out: &mut Vec<u8>) {}
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProbeIdentityResult {
    pub identity: ProbeIdentity,
}

impl CommandResult for ProbeIdentityResult {
    const MIN_LEN: usize = RECORD_LEN;

    fn decode(payload: &[u8]) -> Option<Self> {
        Some(ProbeIdentityResult {
            identity: ProbeIdentity::decode(payload),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeIdentitySetParameter {
    pub identity: ProbeIdentity,
}

impl CommandParameter for ProbeIdentitySetParameter {
    type Result = StatusResult;

    fn opcode(&self) -> Opcode {
        Opcode::ProbeIdentitySet
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.identity.encode(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ee31::commands::ResultCode;

    fn sigma10_payload() -> Vec<u8> {
        let mut p = vec![0x07, 0x01];
        p.extend_from_slice(b"Sigma10");
        p.extend_from_slice(&[0u8; 9]);
        p.extend_from_slice(&[15, 6]);
        p.extend_from_slice(&2025u16.to_le_bytes());
        p.extend_from_slice(&[3, 50]);
        p
    }

    #[test]
    fn test_identity_decode_example() {
        let payload = sigma10_payload();
        assert_eq!(payload.len(), 24);

        let (code, r) = ProbeIdentityResult::interpret(&payload);
        assert_eq!(code, ResultCode::Success);
        assert!(r.identity.is_ee_probe);
        assert_eq!(r.identity.name, "Sigma10");
        assert_eq!(r.identity.calib_expiration, NaiveDate::from_ymd_opt(2025, 6, 15));
        assert_eq!(r.identity.bus_address, 7);
        assert_eq!(r.identity.retries, 3);
        assert_eq!(r.identity.timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_identity_short_payload_is_invalid() {
        let payload = sigma10_payload();
        let (code, r) = ProbeIdentityResult::interpret(&payload[..23]);
        assert_eq!(code, ResultCode::InvalidResult);
        assert_eq!(r, ProbeIdentityResult::default());
        assert!(!r.identity.is_ee_probe);
        assert!(r.identity.name.is_empty());
    }

    #[test]
    fn test_identity_set_sends_record() {
        let identity = ProbeIdentity::decode(&sigma10_payload());
        let p = ProbeIdentitySetParameter { identity };
        assert_eq!(p.opcode(), Opcode::ProbeIdentitySet);
        assert_eq!(p.to_payload(), sigma10_payload());
        assert!(ProbeIdentityGetParameter.to_payload().is_empty());
    }

    #[test]
    fn test_timeout_saturates() {
        let identity = ProbeIdentity {
            timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let mut out = Vec::new();
        identity.encode(&mut out);
        assert_eq!(out.len(), RECORD_LEN);
        assert_eq!(out[23], 0xFF);
    }
}
