// src/ee31/commands/modbus.rs
//
// Modbus gateway configuration: datapoints the probe polls as a Modbus master
// (or serves as a slave) and the slave register mapping.
// Fields inherited from Modbus are big-endian.
//
// Datapoint record (27):
//   [Index-1][SourceType-1][SlaveAddr-1][FunctionCode-1][Register-2-BE][PollSecs-2-BE]
//   [DataType-1][Scale-f32-BE][Warning-f32-BE][Error-f32-BE][Hysteresis-f32-BE]
//   [SourceUnit-1][DisplayUnit-1]
//
// Slave mapping record (8):
//   [Slot-1][DatapointIndex-1][Variant-1][DataType-1][Scale-f32-BE]

use serde::Serialize;

use super::{CommandParameter, CommandResult, StatusResult};
use crate::ee31::convert::BinaryConverter;
use crate::ee31::frame::Opcode;

pub const DATAPOINT_RECORD_LEN: usize = 27;
pub const SLAVE_MAPPING_RECORD_LEN: usize = 8;

/// Declares a byte-coded enum with `code()` / `from_code()`
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
        pub enum $name {
            #[default]
            $($variant),+
        }

        impl $name {
            pub fn code(self) -> u8 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $(c if c == $code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum!(
    /// Where a datapoint value comes from
    SourceType { Master = 0x00, Slave = 0x01 }
);

wire_enum!(
    FunctionCode { ReadHolding = 0x03, ReadInput = 0x04 }
);

wire_enum!(
    /// Register encoding of a value
    DataType { Int16 = 0x00, UInt16 = 0x01, Int32 = 0x02, UInt32 = 0x03, Float32 = 0x04 }
);

wire_enum!(
    /// Which statistic of a datapoint a slave register exposes
    ValueVariant { Actual = 0x00, Minimum = 0x01, Maximum = 0x02, Average = 0x03 }
);

// ============================================================================
// Datapoint
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ModbusDatapoint {
    pub index: u8,
    pub source_type: SourceType,
    pub slave_address: u8,
    pub function_code: FunctionCode,
    pub source_register: u16,
    pub poll_interval_secs: u16,
    pub data_type: DataType,
    pub scale: f32,
    pub warning_limit: f32,
    pub error_limit: f32,
    pub hysteresis: f32,
    pub source_unit: u8,
    pub display_unit: u8,
}

impl ModbusDatapoint {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let c = BinaryConverter::BE;
        out.push(self.index);
        out.push(self.source_type.code());
        out.push(self.slave_address);
        out.push(self.function_code.code());
        c.put_u16(out, self.source_register);
        c.put_u16(out, self.poll_interval_secs);
        out.push(self.data_type.code());
        c.put_f32(out, self.scale);
        c.put_f32(out, self.warning_limit);
        c.put_f32(out, self.error_limit);
        c.put_f32(out, self.hysteresis);
        out.push(self.source_unit);
        out.push(self.display_unit);
    }

    /// `None` if an enumerated byte is out of range
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let c = BinaryConverter::BE;
        Some(ModbusDatapoint {
            index: c.to_u8(payload, 0),
            source_type: SourceType::from_code(c.to_u8(payload, 1))?,
            slave_address: c.to_u8(payload, 2),
            function_code: FunctionCode::from_code(c.to_u8(payload, 3))?,
            source_register: c.to_u16(payload, 4),
            poll_interval_secs: c.to_u16(payload, 6),
            data_type: DataType::from_code(c.to_u8(payload, 8))?,
            scale: c.to_f32(payload, 9),
            warning_limit: c.to_f32(payload, 13),
            error_limit: c.to_f32(payload, 17),
            hysteresis: c.to_f32(payload, 21),
            source_unit: c.to_u8(payload, 25),
            display_unit: c.to_u8(payload, 26),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModbusDatapointGetParameter {
    pub index: u8,
}

impl CommandParameter for ModbusDatapointGetParameter {
    type Result = ModbusDatapointResult;

    fn opcode(&self) -> Opcode {
        Opcode::ModbusDatapointGet
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.index);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ModbusDatapointResult {
    pub datapoint: ModbusDatapoint,
}

impl CommandResult for ModbusDatapointResult {
    const MIN_LEN: usize = DATAPOINT_RECORD_LEN;

    fn decode(payload: &[u8]) -> Option<Self> {
        ModbusDatapoint::decode(payload).map(|datapoint| ModbusDatapointResult { datapoint })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModbusDatapointSetParameter {
    pub datapoint: ModbusDatapoint,
}

impl CommandParameter for ModbusDatapointSetParameter {
    type Result = StatusResult;

    fn opcode(&self) -> Opcode {
        Opcode::ModbusDatapointSet
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.datapoint.encode(out);
    }
}

// ============================================================================
// Slave mapping
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ModbusSlaveMapping {
    pub slot: u8,
    pub datapoint_index: u8,
    pub variant: ValueVariant,
    pub data_type: DataType,
    pub scale: f32,
}

impl ModbusSlaveMapping {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.slot);
        out.push(self.datapoint_index);
        out.push(self.variant.code());
        out.push(self.data_type.code());
        BinaryConverter::BE.put_f32(out, self.scale);
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        let c = BinaryConverter::BE;
        Some(ModbusSlaveMapping {
            slot: c.to_u8(payload, 0),
            datapoint_index: c.to_u8(payload, 1),
            variant: ValueVariant::from_code(c.to_u8(payload, 2))?,
            data_type: DataType::from_code(c.to_u8(payload, 3))?,
            scale: c.to_f32(payload, 4),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModbusSlaveMappingGetParameter {
    pub slot: u8,
}

impl CommandParameter for ModbusSlaveMappingGetParameter {
    type Result = ModbusSlaveMappingResult;

    fn opcode(&self) -> Opcode {
        Opcode::ModbusSlaveMappingGet
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.slot);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ModbusSlaveMappingResult {
    pub mapping: ModbusSlaveMapping,
}

impl CommandResult for ModbusSlaveMappingResult {
    const MIN_LEN: usize = SLAVE_MAPPING_RECORD_LEN;

    fn decode(payload: &[u8]) -> Option<Self> {
        ModbusSlaveMapping::decode(payload).map(|mapping| ModbusSlaveMappingResult { mapping })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModbusSlaveMappingSetParameter {
    pub mapping: ModbusSlaveMapping,
}

impl CommandParameter for ModbusSlaveMappingSetParameter {
    type Result = StatusResult;

    fn opcode(&self) -> Opcode {
        Opcode::ModbusSlaveMappingSet
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.mapping.encode(out);
    }
}
