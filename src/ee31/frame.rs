// src/ee31/frame.rs
//
// EE31 wire framing.
//
// Frame format (request and response):
//   [BusAddr-1byte][Opcode-1byte][Length-1byte][Payload...][CRC16-Modbus-2bytes-LE]
//
// Bus address 0 is broadcast. A probe answers with its own address and the
// request opcode, or with `opcode | 0x80` and a one-byte reason when it
// rejects the request.

use std::fmt;

use crate::io::IoError;

/// EE31 protocol constants
pub mod constants {
    /// Broadcast bus address
    pub const BROADCAST: u8 = 0x00;
    /// Set on the opcode of a rejection response
    pub const NAK_FLAG: u8 = 0x80;
    /// Header: address + opcode + length
    pub const HEADER_LEN: usize = 3;
    pub const CRC_LEN: usize = 2;
    /// Smallest possible frame (empty payload)
    pub const MIN_FRAME_LEN: usize = HEADER_LEN + CRC_LEN;
    pub const MAX_PAYLOAD_LEN: usize = 255;

    // Rejection reasons
    pub const REJECT_UNKNOWN_OPCODE: u8 = 0x01;
    pub const REJECT_BAD_LENGTH: u8 = 0x02;
    pub const REJECT_INVALID_VALUE: u8 = 0x03;
    pub const REJECT_SESSION_MISMATCH: u8 = 0x04;
}

// ============================================================================
// Opcodes
// ============================================================================

/// EE31 command opcodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Discovery,
    DiscoveryAck,
    ProbeIdentityGet,
    ProbeIdentitySet,
    OutputGet,
    OutputSet,
    ModbusDatapointGet,
    ModbusDatapointSet,
    ModbusSlaveMappingGet,
    ModbusSlaveMappingSet,
}

impl Opcode {
    pub const ALL: [Opcode; 10] = [
        Opcode::Discovery,
        Opcode::DiscoveryAck,
        Opcode::ProbeIdentityGet,
        Opcode::ProbeIdentitySet,
        Opcode::OutputGet,
        Opcode::OutputSet,
        Opcode::ModbusDatapointGet,
        Opcode::ModbusDatapointSet,
        Opcode::ModbusSlaveMappingGet,
        Opcode::ModbusSlaveMappingSet,
    ];

    pub fn code(self) -> u8 {
        match self {
            Opcode::Discovery => 0x01,
            Opcode::DiscoveryAck => 0x02,
            Opcode::ProbeIdentityGet => 0x10,
            Opcode::ProbeIdentitySet => 0x11,
            Opcode::OutputGet => 0x20,
            Opcode::OutputSet => 0x21,
            Opcode::ModbusDatapointGet => 0x30,
            Opcode::ModbusDatapointSet => 0x31,
            Opcode::ModbusSlaveMappingGet => 0x32,
            Opcode::ModbusSlaveMappingSet => 0x33,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = IoError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| op.code() == code)
            .ok_or_else(|| IoError::protocol("ee31", format!("unknown opcode 0x{:02X}", code)))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.code())
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One decoded EE31 frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    /// Raw opcode byte, NAK flag included
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(address: u8, opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            address,
            opcode: opcode.code(),
            payload,
        }
    }

    /// Rejection response for `opcode` with a one-byte reason
    pub fn nak(address: u8, opcode: u8, reason: u8) -> Self {
        Self {
            address,
            opcode: opcode | constants::NAK_FLAG,
            payload: vec![reason],
        }
    }

    pub fn is_nak(&self) -> bool {
        self.opcode & constants::NAK_FLAG != 0
    }

    /// Opcode with the NAK flag stripped
    pub fn base_opcode(&self) -> u8 {
        self.opcode & !constants::NAK_FLAG
    }

    /// Serialise to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>, IoError> {
        use constants::*;

        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(IoError::protocol(
                "ee31",
                format!(
                    "payload too long: {} bytes (max {})",
                    self.payload.len(),
                    MAX_PAYLOAD_LEN
                ),
            ));
        }

        let mut buf = Vec::with_capacity(MIN_FRAME_LEN + self.payload.len());
        buf.push(self.address);
        buf.push(self.opcode);
        buf.push(self.payload.len() as u8);
        buf.extend_from_slice(&self.payload);
        let crc = crc16_modbus(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decode exactly one complete frame.
    pub fn decode(raw: &[u8]) -> Result<Frame, IoError> {
        use constants::*;

        if raw.len() < MIN_FRAME_LEN {
            return Err(IoError::protocol(
                "ee31",
                format!("frame too short: {} bytes, need at least {}", raw.len(), MIN_FRAME_LEN),
            ));
        }

        let len = raw[2] as usize;
        let total = HEADER_LEN + len + CRC_LEN;
        if raw.len() != total {
            return Err(IoError::protocol(
                "ee31",
                format!("length mismatch: {} bytes, header says {}", raw.len(), total),
            ));
        }

        let expected = crc16_modbus(&raw[..total - CRC_LEN]);
        let received = u16::from_le_bytes([raw[total - 2], raw[total - 1]]);
        if expected != received {
            return Err(IoError::protocol(
                "ee31",
                format!("crc mismatch: got {:04X}, expected {:04X}", received, expected),
            ));
        }

        Ok(Frame {
            address: raw[0],
            opcode: raw[1],
            payload: raw[HEADER_LEN..HEADER_LEN + len].to_vec(),
        })
    }
}

// ============================================================================
// CRC
// ============================================================================

/// CRC-16/Modbus (poly 0x8005 reflected = 0xA001, init 0xFFFF, no xorout)
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

// ============================================================================
// Stream parser
// ============================================================================

/// Extracts frames from a byte stream. Bytes in front of the first valid
/// frame are discarded; a corrupt length byte cannot stall the parser
/// because later start positions are tried as well.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
}

impl FrameParser {
    /// Longest possible frame; anything older than that cannot start one
    const MAX_BUFFER: usize =
        constants::HEADER_LEN + constants::MAX_PAYLOAD_LEN + constants::CRC_LEN;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// First complete, CRC-valid frame in the buffer: (start, total length)
    fn find_frame(&self) -> Option<(usize, usize)> {
        use constants::*;

        if self.buffer.len() < MIN_FRAME_LEN {
            return None;
        }
        (0..=self.buffer.len() - MIN_FRAME_LEN).find_map(|start| {
            let total = HEADER_LEN + self.buffer[start + 2] as usize + CRC_LEN;
            let end = start + total;
            if end > self.buffer.len() {
                return None;
            }
            Frame::decode(&self.buffer[start..end])
                .ok()
                .map(|_| (start, total))
        })
    }

    /// Feed bytes and return every complete frame now available
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        while let Some((start, total)) = self.find_frame() {
            let raw: Vec<u8> = self.buffer.drain(..start + total).skip(start).collect();
            if let Ok(frame) = Frame::decode(&raw) {
                frames.push(frame);
            }
        }

        if self.buffer.len() > Self::MAX_BUFFER {
            let excess = self.buffer.len() - Self::MAX_BUFFER;
            self.buffer.drain(..excess);
        }

        frames
    }
}
