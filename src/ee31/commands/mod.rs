// src/ee31/commands/mod.rs
//
// Command catalog: typed parameter/result pairs.
// Each parameter lays its fields out as payload bytes; each result validates
// a minimum payload length before extracting fixed-offset fields.

pub mod discovery;
pub mod modbus;
pub mod output;
pub mod probe;

pub use discovery::{
    AnnouncedDevice, DiscoveryAckParameter, DiscoveryAckResult, DiscoveryParameter,
    DiscoveryResult,
};
pub use modbus::{
    DataType, FunctionCode, ModbusDatapoint, ModbusDatapointGetParameter,
    ModbusDatapointResult, ModbusDatapointSetParameter, ModbusSlaveMapping,
    ModbusSlaveMappingGetParameter, ModbusSlaveMappingResult, ModbusSlaveMappingSetParameter,
    SourceType, ValueVariant,
};
pub use output::{
    Measurand, OutputGetParameter, OutputIndex, OutputRange, OutputResult, OutputSetParameter,
};
pub use probe::{ProbeIdentity, ProbeIdentityGetParameter, ProbeIdentityResult, ProbeIdentitySetParameter};

use serde::Serialize;
use std::fmt;

use super::frame::Opcode;

/// Outcome of one command execution. Callers must check it before trusting
/// the typed result fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum ResultCode {
    Success,
    /// Payload too short or malformed
    #[default]
    InvalidResult,
    /// No complete response before the receive timeout
    Timeout,
    /// Writing or reading the channel failed
    TransportError,
    /// Channel could not be connected
    NotConnected,
    /// Probe answered with a rejection frame carrying this reason
    Rejected(u8),
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Rejected(reason) => write!(f, "Rejected(0x{:02X})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Typed request payload of one command.
pub trait CommandParameter: Send + Sync {
    type Result: CommandResult;

    fn opcode(&self) -> Opcode;

    /// Append the fixed-format payload
    fn encode(&self, out: &mut Vec<u8>);

    /// Post-process the encoded payload against protocol lookup tables
    /// (logical codes to wire codes). Default: no change.
    fn remap(&self, _payload: &mut [u8]) {}

    /// Reject responses that belong to another exchange (e.g. a foreign
    /// discovery session). Default: accept.
    fn matches_response(&self, _payload: &[u8]) -> bool {
        true
    }

    /// Encoded payload with remapping applied
    fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        self.remap(&mut out);
        out
    }
}

/// Typed response payload of one command.
pub trait CommandResult: Default + Send + fmt::Debug {
    /// Shortest payload that can be decoded
    const MIN_LEN: usize;

    /// Extract fields; only called with at least `MIN_LEN` bytes.
    /// `None` means the payload is malformed.
    fn decode(payload: &[u8]) -> Option<Self>;

    /// Validate and decode. Short or malformed payloads yield
    /// `InvalidResult` and default field values, never a panic.
    fn interpret(payload: &[u8]) -> (ResultCode, Self) {
        if payload.len() < Self::MIN_LEN {
            return (ResultCode::InvalidResult, Self::default());
        }
        match Self::decode(payload) {
            Some(result) => (ResultCode::Success, result),
            None => (ResultCode::InvalidResult, Self::default()),
        }
    }
}

/// Answer of every set command: one status byte, 0 = accepted
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusResult {
    pub status: u8,
}

impl StatusResult {
    pub const ACCEPTED: u8 = 0x00;

    pub fn accepted(&self) -> bool {
        self.status == Self::ACCEPTED
    }
}

impl CommandResult for StatusResult {
    const MIN_LEN: usize = 1;

    fn decode(payload: &[u8]) -> Option<Self> {
        Some(StatusResult { status: payload[0] })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_result() {
        let (code, r) = StatusResult::interpret(&[]);
        assert_eq!(code, ResultCode::InvalidResult);
        assert_eq!(r, StatusResult::default());

        let (code, r) = StatusResult::interpret(&[0x00]);
        assert_eq!(code, ResultCode::Success);
        assert!(r.accepted());

        let (_, r) = StatusResult::interpret(&[0x03]);
        assert!(!r.accepted());
    }

    #[test]
    fn test_result_code_display() {
        assert_eq!(ResultCode::Rejected(0x0A).to_string(), "Rejected(0x0A)");
        assert_eq!(ResultCode::Timeout.to_string(), "Timeout");
        assert!(ResultCode::Success.is_success());
        assert!(!ResultCode::default().is_success());
    }
}
