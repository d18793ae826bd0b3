// src/io/serial/utils.rs
//
// Serial line settings and their compact string form ("9600 8N1").
// Provides conversion functions for the serialport crate.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serialport::{DataBits, FlowControl, Parity as SpParity, StopBits as SpStopBits};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::io::IoError;

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl Parity {
    fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }

    fn from_token(s: &str) -> Option<Self> {
        match s {
            "N" | "n" => Some(Parity::None),
            "E" | "e" => Some(Parity::Even),
            "O" | "o" => Some(Parity::Odd),
            _ => None,
        }
    }
}

/// Stop bits setting. `None` and `OnePointFive` exist on some platforms but
/// have no canonical compact form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum StopBits {
    None,
    #[default]
    One,
    OnePointFive,
    Two,
}

impl StopBits {
    fn from_token(s: &str) -> Option<Self> {
        match s {
            "N" | "n" | "0" => Some(StopBits::None),
            "1" => Some(StopBits::One),
            "1.5" => Some(StopBits::OnePointFive),
            "2" => Some(StopBits::Two),
            _ => None,
        }
    }

    fn canonical_token(self) -> Option<&'static str> {
        match self {
            StopBits::One => Some("1"),
            StopBits::Two => Some("2"),
            StopBits::None | StopBits::OnePointFive => None,
        }
    }
}

/// Flow control
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Handshake {
    #[default]
    None,
    XonXoff,
    RequestToSend,
    RequestToSendXonXoff,
}

/// Line settings of one serial port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComPortSettings {
    pub baud_rate: u32,
    /// 7 or 8
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub handshake: Handshake,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ComPortSettings {
    fn default() -> Self {
        Self::default_8n1()
    }
}

impl ComPortSettings {
    pub fn new(baud_rate: u32, data_bits: u8, parity: Parity, stop_bits: StopBits) -> Self {
        Self {
            baud_rate,
            data_bits,
            parity,
            stop_bits,
            handshake: Handshake::None,
            read_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(500),
        }
    }

    /// Default probe line settings: 9600 8N1
    pub fn default_8n1() -> Self {
        Self::new(9600, 8, Parity::None, StopBits::One)
    }

    /// Alternate probe line settings: 9600 8E1
    pub fn alternate_8e1() -> Self {
        Self::new(9600, 8, Parity::Even, StopBits::One)
    }

    /// Parse a compact settings string. Accepts space, comma and underscore
    /// separated variants: "9600 8N1", "9600,8,N,1", "9600_8E1".
    /// Returns `None` for anything malformed or unsupported.
    pub fn parse(s: &str) -> Option<Self> {
        let tokens: Vec<&str> = s
            .split(|c: char| c == ' ' || c == ',' || c == '_')
            .filter(|t| !t.is_empty())
            .collect();

        let (baud, data, parity, stop) = match tokens.as_slice() {
            [baud, compact] => {
                let mut chars = compact.char_indices();
                let (_, d) = chars.next()?;
                let (pi, p) = chars.next()?;
                let stop = &compact[pi + p.len_utf8()..];
                (*baud, &compact[..d.len_utf8()], &compact[pi..pi + p.len_utf8()], stop)
            }
            [baud, data, parity, stop] => (*baud, *data, *parity, *stop),
            _ => return None,
        };

        if baud.is_empty() || !baud.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let baud_rate: u32 = baud.parse().ok()?;
        if baud_rate == 0 {
            return None;
        }

        let data_bits: u8 = match data {
            "7" => 7,
            "8" => 8,
            _ => return None,
        };
        let parity = Parity::from_token(parity)?;
        let stop_bits = StopBits::from_token(stop)?;

        Some(Self::new(baud_rate, data_bits, parity, stop_bits))
    }

    /// Canonical compact form ("9600 8N1"). `None` when the stop bits have
    /// no canonical token (None, 1.5).
    pub fn to_compact(&self) -> Option<String> {
        let stop = self.stop_bits.canonical_token()?;
        Some(format!(
            "{} {}{}{}",
            self.baud_rate,
            self.data_bits,
            self.parity.letter(),
            stop
        ))
    }
}

impl fmt::Display for ComPortSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_compact() {
            Some(s) => f.write_str(&s),
            None => write!(
                f,
                "{} {}{}{:?}",
                self.baud_rate,
                self.data_bits,
                self.parity.letter(),
                self.stop_bits
            ),
        }
    }
}

impl FromStr for ComPortSettings {
    type Err = IoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| IoError::configuration(format!("Invalid line settings '{}'", s)))
    }
}

// Settings files store line settings in their compact form
impl Serialize for ComPortSettings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ComPortSettings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ComPortSettings::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid line settings '{}'", s)))
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert our Parity enum to serialport crate's Parity type
pub fn to_serialport_parity(p: Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

/// Convert data bits count to serialport crate's DataBits type
pub fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

/// Convert stop bits to serialport crate's StopBits type.
/// serialport only knows one and two stop bits.
pub fn to_serialport_stop_bits(bits: StopBits) -> SpStopBits {
    match bits {
        StopBits::Two | StopBits::OnePointFive => SpStopBits::Two,
        StopBits::None | StopBits::One => SpStopBits::One,
    }
}

/// Convert handshake to serialport crate's FlowControl type
pub fn to_serialport_flow_control(h: Handshake) -> FlowControl {
    match h {
        Handshake::None => FlowControl::None,
        Handshake::XonXoff => FlowControl::Software,
        Handshake::RequestToSend | Handshake::RequestToSendXonXoff => FlowControl::Hardware,
    }
}

// ============================================================================
// Tests
// ============================================================================
