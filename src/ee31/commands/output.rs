// src/ee31/commands/output.rs
//
// Analogue output measurand and range.
//
// Request (get): [Output-1]
// Record (10):   [Output-1][MeasurandWireIndex-1][RangeMin-f32-LE][RangeMax-f32-LE]
//
// The probe firmware indexes measurands by its own table, which differs from
// the logical codes exposed here; set remaps on the way out, get maps back.

use serde::Serialize;

use super::{CommandParameter, CommandResult, StatusResult};
use crate::ee31::convert::BinaryConverter;
use crate::ee31::frame::Opcode;

pub const RECORD_LEN: usize = 10;

/// One of the two analogue outputs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum OutputIndex {
    #[default]
    One,
    Two,
}

impl OutputIndex {
    pub fn code(self) -> u8 {
        match self {
            OutputIndex::One => 1,
            OutputIndex::Two => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(OutputIndex::One),
            2 => Some(OutputIndex::Two),
            _ => None,
        }
    }
}

/// Physical quantity an output represents
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Measurand {
    #[default]
    Temperature,
    RelativeHumidity,
    DewPoint,
    FrostPoint,
    AbsoluteHumidity,
    MixingRatio,
    WetBulb,
    WaterVaporPressure,
    Enthalpy,
    /// Firmware index without a known mapping; written back as read
    UnknownWire(u8),
}

/// (measurand, logical code, firmware wire index)
static MEASURAND_TABLE: [(Measurand, u8, u8); 9] = [
    (Measurand::Temperature, 0x01, 0x00),
    (Measurand::RelativeHumidity, 0x02, 0x01),
    (Measurand::DewPoint, 0x03, 0x05),
    (Measurand::FrostPoint, 0x04, 0x06),
    (Measurand::AbsoluteHumidity, 0x05, 0x08),
    (Measurand::MixingRatio, 0x06, 0x09),
    (Measurand::WetBulb, 0x07, 0x0A),
    (Measurand::WaterVaporPressure, 0x08, 0x0B),
    (Measurand::Enthalpy, 0x09, 0x0C),
];

impl Measurand {
    fn entry(self) -> Option<&'static (Measurand, u8, u8)> {
        MEASURAND_TABLE.iter().find(|(m, _, _)| *m == self)
    }

    /// Logical code; `None` for an unmapped firmware index
    pub fn code(self) -> Option<u8> {
        self.entry().map(|(_, code, _)| *code)
    }

    pub fn from_code(code: u8) -> Option<Self> {
        MEASURAND_TABLE
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(m, _, _)| *m)
    }

    /// Firmware index sent on the wire
    pub fn wire_index(self) -> u8 {
        match self {
            Measurand::UnknownWire(wire) => wire,
            known => known.entry().map(|(_, _, wire)| *wire).unwrap_or(0),
        }
    }

    /// Firmware index to measurand
    pub fn from_wire_index(wire: u8) -> Self {
        MEASURAND_TABLE
            .iter()
            .find(|(_, _, w)| *w == wire)
            .map(|(m, _, _)| *m)
            .unwrap_or(Measurand::UnknownWire(wire))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct OutputRange {
    pub output: OutputIndex,
    pub measurand: Measurand,
    pub range_min: f32,
    pub range_max: f32,
}

// ============================================================================
// Get
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputGetParameter {
    pub output: OutputIndex,
}

impl CommandParameter for OutputGetParameter {
    type Result = OutputResult;

    fn opcode(&self) -> Opcode {
        Opcode::OutputGet
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.output.code());
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct OutputResult {
    pub range: OutputRange,
}

impl CommandResult for OutputResult {
    const MIN_LEN: usize = RECORD_LEN;

    fn decode(payload: &[u8]) -> Option<Self> {
        let c = BinaryConverter::LE;
        Some(OutputResult {
            range: OutputRange {
                output: OutputIndex::from_code(payload[0])?,
                measurand: Measurand::from_wire_index(payload[1]),
                range_min: c.to_f32(payload, 2),
                range_max: c.to_f32(payload, 6),
            },
        })
    }
}

// ============================================================================
// Set
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputSetParameter {
    pub range: OutputRange,
}

impl CommandParameter for OutputSetParameter {
    type Result = StatusResult;

    fn opcode(&self) -> Opcode {
        Opcode::OutputSet
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let c = BinaryConverter::LE;
        out.push(self.range.output.code());
        out.push(self.range.measurand.code().unwrap_or(0));
        c.put_f32(out, self.range.range_min);
        c.put_f32(out, self.range.range_max);
    }

    // mapped from the typed measurand, never from the logical byte
    fn remap(&self, payload: &mut [u8]) {
        if let Some(slot) = payload.get_mut(1) {
            *slot = self.range.measurand.wire_index();
        }
    }
}
