// src/io/emulation/probe.rs
//
// A software EE31 probe. Holds the full configurable state and answers every
// cataloged command the way probe firmware does, including discovery muting:
//
// - Discovery records the session the probe answered.
// - DiscoveryAck carrying that session mutes the probe.
// - A muted probe ignores broadcasts until it is addressed directly; any
//   addressed request unmutes it.

use std::collections::BTreeMap;

use super::EmulatedDeviceSettings;
use crate::ee31::commands::discovery::{AnnouncedDevice, DiscoveryResult};
use crate::ee31::commands::{
    probe, FunctionCode, ModbusDatapoint, ModbusSlaveMapping, ProbeIdentity, StatusResult,
};
use crate::ee31::convert::BinaryConverter;
use crate::ee31::frame::constants::*;
use crate::ee31::frame::{Frame, Opcode};

pub const DATAPOINT_COUNT: u8 = 8;
pub const SLAVE_MAPPING_COUNT: u8 = 16;

const DISCOVERY_REQUEST_LEN: usize = 7;
const ACK_REQUEST_LEN: usize = 3;
const OUTPUT_RECORD_LEN: usize = 10;

#[derive(Debug)]
pub struct EmulatedProbe {
    settings: EmulatedDeviceSettings,
    identity: ProbeIdentity,
    /// Raw output records as the firmware stores them (wire measurand index)
    outputs: [[u8; OUTPUT_RECORD_LEN]; 2],
    datapoints: BTreeMap<u8, ModbusDatapoint>,
    slave_mappings: BTreeMap<u8, ModbusSlaveMapping>,
    last_session: Option<u16>,
    muted: bool,
    /// Requests answered so far
    answered: usize,
}

fn output_record(output: u8, wire_measurand: u8, min: f32, max: f32) -> [u8; OUTPUT_RECORD_LEN] {
    let mut raw = Vec::with_capacity(OUTPUT_RECORD_LEN);
    raw.push(output);
    raw.push(wire_measurand);
    BinaryConverter::LE.put_f32(&mut raw, min);
    BinaryConverter::LE.put_f32(&mut raw, max);
    let mut record = [0u8; OUTPUT_RECORD_LEN];
    record.copy_from_slice(&raw);
    record
}

impl EmulatedProbe {
    pub fn new(settings: EmulatedDeviceSettings) -> Self {
        let identity = ProbeIdentity {
            bus_address: settings.bus_address,
            is_ee_probe: settings.is_ee_probe,
            name: if settings.name.is_empty() {
                settings.model.clone()
            } else {
                settings.name.clone()
            },
            calib_expiration: settings.calib_expiration,
            ..Default::default()
        };

        let datapoints = (0..DATAPOINT_COUNT)
            .map(|index| {
                (
                    index,
                    ModbusDatapoint {
                        index,
                        function_code: FunctionCode::ReadHolding,
                        poll_interval_secs: 10,
                        scale: 1.0,
                        ..Default::default()
                    },
                )
            })
            .collect();

        let slave_mappings = (0..SLAVE_MAPPING_COUNT)
            .map(|slot| {
                (
                    slot,
                    ModbusSlaveMapping {
                        slot,
                        scale: 1.0,
                        ..Default::default()
                    },
                )
            })
            .collect();

        Self {
            identity,
            // T -40..60 on output 1, RH 0..100 on output 2
            outputs: [
                output_record(1, 0x00, -40.0, 60.0),
                output_record(2, 0x01, 0.0, 100.0),
            ],
            datapoints,
            slave_mappings,
            last_session: None,
            muted: false,
            answered: 0,
            settings,
        }
    }

    pub fn settings(&self) -> &EmulatedDeviceSettings {
        &self.settings
    }

    pub fn bus_address(&self) -> u8 {
        self.identity.bus_address
    }

    pub fn identity(&self) -> &ProbeIdentity {
        &self.identity
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn answered(&self) -> usize {
        self.answered
    }

    /// Handle one request frame; `None` when the probe stays silent.
    pub fn handle(&mut self, request: &Frame) -> Option<Frame> {
        let addressed = request.address != BROADCAST;
        if addressed && request.address != self.bus_address() {
            return None;
        }
        if request.is_nak() {
            return None;
        }
        if addressed {
            self.muted = false;
        } else if self.muted {
            return None;
        }

        let opcode = match Opcode::try_from(request.opcode) {
            Ok(op) => op,
            Err(_) => return self.reject(request, REJECT_UNKNOWN_OPCODE),
        };

        let response = match opcode {
            Opcode::Discovery => self.discovery(request),
            Opcode::DiscoveryAck => self.discovery_ack(request),
            Opcode::ProbeIdentityGet => Ok(Some(self.identity_record())),
            Opcode::ProbeIdentitySet => self.identity_set(&request.payload),
            Opcode::OutputGet => self.output_get(&request.payload),
            Opcode::OutputSet => self.output_set(&request.payload),
            Opcode::ModbusDatapointGet => self.datapoint_get(&request.payload),
            Opcode::ModbusDatapointSet => self.datapoint_set(&request.payload),
            Opcode::ModbusSlaveMappingGet => self.mapping_get(&request.payload),
            Opcode::ModbusSlaveMappingSet => self.mapping_set(&request.payload),
        };

        match response {
            Ok(Some(payload)) => {
                self.answered += 1;
                Some(Frame::new(self.bus_address(), opcode, payload))
            }
            Ok(None) => None,
            Err(reason) => self.reject(request, reason),
        }
    }

    fn reject(&mut self, request: &Frame, reason: u8) -> Option<Frame> {
        // Broadcasts are never rejected, several probes would answer at once
        if request.address == BROADCAST {
            return None;
        }
        self.answered += 1;
        Some(Frame::nak(self.bus_address(), request.opcode, reason))
    }

    fn status(status: u8) -> Vec<u8> {
        vec![status]
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    fn discovery(&mut self, request: &Frame) -> Result<Option<Vec<u8>>, u8> {
        let p = &request.payload;
        if p.len() < DISCOVERY_REQUEST_LEN {
            return Err(REJECT_BAD_LENGTH);
        }
        let c = BinaryConverter::LE;
        let session_id = c.to_u16(p, 0);
        let target = c.to_u8(p, 2);
        if target != BROADCAST && target != self.bus_address() {
            return Ok(None);
        }

        self.last_session = Some(session_id);
        let result = DiscoveryResult {
            session_id,
            devices: vec![AnnouncedDevice {
                bus_address: self.bus_address(),
                model: self.settings.model.clone(),
            }],
        };
        let mut payload = Vec::new();
        result.encode(&mut payload);
        Ok(Some(payload))
    }

    fn discovery_ack(&mut self, request: &Frame) -> Result<Option<Vec<u8>>, u8> {
        let p = &request.payload;
        if p.len() < ACK_REQUEST_LEN {
            return Err(REJECT_BAD_LENGTH);
        }
        let target = p[0];
        let session_id = BinaryConverter::LE.to_u16(p, 1);
        if target != self.bus_address() {
            return Ok(None);
        }
        if self.last_session != Some(session_id) {
            return Err(REJECT_SESSION_MISMATCH);
        }
        self.muted = true;
        Ok(Some(vec![self.bus_address()]))
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    fn identity_record(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(probe::RECORD_LEN);
        self.identity.encode(&mut payload);
        payload
    }

    fn identity_set(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>, u8> {
        if payload.len() != probe::RECORD_LEN {
            return Err(REJECT_BAD_LENGTH);
        }
        let identity = ProbeIdentity::decode(payload);
        if identity.bus_address == BROADCAST {
            return Err(REJECT_INVALID_VALUE);
        }
        self.identity = identity;
        Ok(Some(Self::status(StatusResult::ACCEPTED)))
    }

    // ------------------------------------------------------------------------
    // Outputs
    // ------------------------------------------------------------------------

    fn output_slot(output: u8) -> Result<usize, u8> {
        match output {
            1 | 2 => Ok(output as usize - 1),
            _ => Err(REJECT_INVALID_VALUE),
        }
    }

    fn output_get(&self, payload: &[u8]) -> Result<Option<Vec<u8>>, u8> {
        let output = *payload.first().ok_or(REJECT_BAD_LENGTH)?;
        let slot = Self::output_slot(output)?;
        Ok(Some(self.outputs[slot].to_vec()))
    }

    fn output_set(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>, u8> {
        if payload.len() != OUTPUT_RECORD_LEN {
            return Err(REJECT_BAD_LENGTH);
        }
        let slot = Self::output_slot(payload[0])?;
        self.outputs[slot].copy_from_slice(payload);
        Ok(Some(Self::status(StatusResult::ACCEPTED)))
    }

    // ------------------------------------------------------------------------
    // Modbus
    // ------------------------------------------------------------------------

    fn datapoint_get(&self, payload: &[u8]) -> Result<Option<Vec<u8>>, u8> {
        let index = *payload.first().ok_or(REJECT_BAD_LENGTH)?;
        let datapoint = self.datapoints.get(&index).ok_or(REJECT_INVALID_VALUE)?;
        let mut out = Vec::new();
        datapoint.encode(&mut out);
        Ok(Some(out))
    }

    fn datapoint_set(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>, u8> {
        let datapoint = ModbusDatapoint::decode(payload).ok_or(REJECT_INVALID_VALUE)?;
        let slot = self
            .datapoints
            .get_mut(&datapoint.index)
            .ok_or(REJECT_INVALID_VALUE)?;
        *slot = datapoint;
        Ok(Some(Self::status(StatusResult::ACCEPTED)))
    }

    fn mapping_get(&self, payload: &[u8]) -> Result<Option<Vec<u8>>, u8> {
        let slot = *payload.first().ok_or(REJECT_BAD_LENGTH)?;
        let mapping = self.slave_mappings.get(&slot).ok_or(REJECT_INVALID_VALUE)?;
        let mut out = Vec::new();
        mapping.encode(&mut out);
        Ok(Some(out))
    }

    fn mapping_set(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>, u8> {
        let mapping = ModbusSlaveMapping::decode(payload).ok_or(REJECT_INVALID_VALUE)?;
        if !self.datapoints.contains_key(&mapping.datapoint_index) {
            return Err(REJECT_INVALID_VALUE);
        }
        let slot = self
            .slave_mappings
            .get_mut(&mapping.slot)
            .ok_or(REJECT_INVALID_VALUE)?;
        *slot = mapping;
        Ok(Some(Self::status(StatusResult::ACCEPTED)))
    }
}
