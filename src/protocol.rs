use crate::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const START_BYTE: u8 = 0xDD;
pub const STOP_BYTE: u8 = 0x77;
const READ_BYTE: u8 = 0xA5;
const WRITE_BYTE: u8 = 0x5A;
const STATUS_OK: u8 = 0x00;

pub const CMD_BASIC_SYSTEM_INFO: u8 = 0x03;
pub const CMD_CELL_VOLTAGES: u8 = 0x04;
pub const CMD_NAME: u8 = 0x05;
pub const CMD_CTL_MOSFET: u8 = 0xE1;

/// Fixed per-pack maxima of the reference deployment. Reported counts above
/// these bound every decode loop.
pub const NUM_CELLS: usize = 8;
pub const NUM_TEMP_SENSORS: usize = 2;

/// Largest response the device emits; sized like the original firmware's
/// receive buffer.
pub const RX_BUFFER_SIZE: usize = 64;

// Header (4) plus trailing checksum (2); the STOP terminator is consumed by
// the transport and never lands in the buffer.
const MIN_RESPONSE_LENGTH: usize = 6;

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

/// Sum of all covered bytes, then two's-complement negation modulo 65536.
/// Covers offsets 2 through the end of payload on both requests and
/// responses.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for b in bytes {
        sum = sum.wrapping_add(*b as u16);
    }
    0xFFFFu16.wrapping_sub(sum).wrapping_add(1)
}

fn build_frame(direction: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + payload.len());
    frame.push(START_BYTE);
    frame.push(direction);
    frame.push(command);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    let crc = checksum(&frame[2..]);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.push(STOP_BYTE);
    log::trace!("build_frame: {:02X?}", frame);
    frame
}

/// Zero-payload read request for `command`.
pub fn read_request(command: u8) -> Vec<u8> {
    build_frame(READ_BYTE, command, &[])
}

/// Validate a received buffer against the command that was requested.
///
/// `buffer[..bytes_received]` holds the response up to but not including the
/// STOP terminator. Nothing may be decoded from a buffer this has not
/// accepted.
pub fn validate(buffer: &[u8], expected_command: u8, bytes_received: usize) -> Result<(), Error> {
    if bytes_received == 0 {
        log::warn!("No response received for command {expected_command:#04X}");
        return Err(Error::Timeout);
    }
    if bytes_received < MIN_RESPONSE_LENGTH {
        log::warn!(
            "Incomplete response - received={} minimum={}",
            bytes_received,
            MIN_RESPONSE_LENGTH
        );
        return Err(Error::Timeout);
    }
    let frame = buffer
        .get(..bytes_received)
        .ok_or(Error::Framing("reply shorter than reported byte count"))?;

    if frame[0] != START_BYTE {
        log::warn!("Invalid start marker - received={:#04X}", frame[0]);
        return Err(Error::Framing("start marker"));
    }
    if frame[1] != expected_command {
        log::warn!(
            "Command echo mismatch - expected={expected_command:#04X} received={:#04X}",
            frame[1]
        );
        return Err(Error::Framing("command echo"));
    }
    if frame[2] != STATUS_OK {
        log::warn!("Device reported error status {:#04X}", frame[2]);
        return Err(Error::Framing("status code"));
    }
    // The length byte must agree with the received span, otherwise the
    // decoders cannot trust their fixed offsets.
    if frame[3] as usize + MIN_RESPONSE_LENGTH != bytes_received {
        log::warn!(
            "Length field mismatch - length={} received={}",
            frame[3],
            bytes_received
        );
        return Err(Error::Framing("length field"));
    }

    let calculated = checksum(&frame[2..bytes_received - 2]);
    let received = u16::from_be_bytes([frame[bytes_received - 2], frame[bytes_received - 1]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={calculated:#06X} received={received:#06X} buffer={frame:02X?}"
        );
        return Err(Error::Checksum {
            calculated,
            received,
        });
    }
    Ok(())
}

fn validate_len(buffer: &[u8], required: usize) -> Result<(), Error> {
    if buffer.len() < required {
        log::warn!(
            "Reply too short - required={} received={}",
            required,
            buffer.len()
        );
        return Err(Error::Framing("reply payload too short"));
    }
    Ok(())
}

/// Production date, bit-packed on the wire as `yyyyyyymmmmddddd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProductionDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl Default for ProductionDate {
    fn default() -> Self {
        Self {
            year: 2000,
            month: 1,
            day: 1,
        }
    }
}

impl From<u16> for ProductionDate {
    fn from(date: u16) -> Self {
        Self {
            day: (date & 0x1F) as u8,
            month: ((date >> 5) & 0x0F) as u8,
            year: 2000 + (date >> 9),
        }
    }
}

/// Firmware version, one nibble each for major and minor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SoftwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl From<u8> for SoftwareVersion {
    fn from(version: u8) -> Self {
        Self {
            major: (version >> 4) & 0x0F,
            minor: version & 0x0F,
        }
    }
}

/// The 13 protection flags reported in the basic-info response, bit 0 to
/// bit 12 of the protection-status word.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProtectionStatus {
    pub single_cell_overvoltage: bool,
    pub single_cell_undervoltage: bool,
    pub pack_overvoltage: bool,
    pub pack_undervoltage: bool,
    pub charge_over_temperature: bool,
    pub charge_under_temperature: bool,
    pub discharge_over_temperature: bool,
    pub discharge_under_temperature: bool,
    pub charge_overcurrent: bool,
    pub discharge_overcurrent: bool,
    pub short_circuit: bool,
    pub frontend_ic_error: bool,
    pub software_lock: bool,
}

impl From<u16> for ProtectionStatus {
    fn from(status: u16) -> Self {
        Self {
            single_cell_overvoltage: read_bit!(status, 0),
            single_cell_undervoltage: read_bit!(status, 1),
            pack_overvoltage: read_bit!(status, 2),
            pack_undervoltage: read_bit!(status, 3),
            charge_over_temperature: read_bit!(status, 4),
            charge_under_temperature: read_bit!(status, 5),
            discharge_over_temperature: read_bit!(status, 6),
            discharge_under_temperature: read_bit!(status, 7),
            charge_overcurrent: read_bit!(status, 8),
            discharge_overcurrent: read_bit!(status, 9),
            short_circuit: read_bit!(status, 10),
            frontend_ic_error: read_bit!(status, 11),
            software_lock: read_bit!(status, 12),
        }
    }
}

/// Everything the 0x03 basic-info response carries.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BasicInfo {
    pub total_voltage: f32,
    pub current: f32, // negative=discharging, positive=charging
    pub balance_capacity: f32,
    pub rated_capacity: f32,
    pub cycle_count: u16,
    pub production_date: ProductionDate,
    pub protection_status: ProtectionStatus,
    pub software_version: SoftwareVersion,
    pub state_of_charge: u8,
    pub charge_fet_enabled: bool,
    pub discharge_fet_enabled: bool,
    pub num_cells: u8,
    pub num_temperature_sensors: u8,
    pub temperatures: Vec<f32>,
    /// Bit *i* set = cell *i* currently balancing.
    pub balance_status: u32,
}

impl BasicInfo {
    pub fn request() -> Vec<u8> {
        read_request(CMD_BASIC_SYSTEM_INFO)
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, Error> {
        validate_len(buffer, 27)?;

        let num_temperature_sensors = buffer[26];
        let n_sensors = usize::from(num_temperature_sensors).min(NUM_TEMP_SENSORS);
        validate_len(buffer, 27 + 2 * n_sensors)?;

        let mut temperatures = Vec::with_capacity(n_sensors);
        for i in 0..n_sensors {
            let raw = u16::from_be_bytes([buffer[27 + 2 * i], buffer[28 + 2 * i]]);
            // Tenths of Kelvin on the wire.
            temperatures.push(raw as f32 * 0.1 - 273.15);
        }

        // Two big-endian 16-bit halves; low half first in the payload. This
        // is not a 32-bit big-endian word.
        let balance_low = u16::from_be_bytes([buffer[16], buffer[17]]) as u32;
        let balance_high = u16::from_be_bytes([buffer[18], buffer[19]]) as u32;

        Ok(Self {
            total_voltage: u16::from_be_bytes([buffer[4], buffer[5]]) as f32 * 0.01,
            current: i16::from_be_bytes([buffer[6], buffer[7]]) as f32 * 0.01,
            balance_capacity: u16::from_be_bytes([buffer[8], buffer[9]]) as f32 * 0.01,
            rated_capacity: u16::from_be_bytes([buffer[10], buffer[11]]) as f32 * 0.01,
            cycle_count: u16::from_be_bytes([buffer[12], buffer[13]]),
            production_date: u16::from_be_bytes([buffer[14], buffer[15]]).into(),
            protection_status: u16::from_be_bytes([buffer[20], buffer[21]]).into(),
            software_version: buffer[22].into(),
            state_of_charge: buffer[23],
            charge_fet_enabled: read_bit!(buffer[24], 0),
            discharge_fet_enabled: read_bit!(buffer[24], 1),
            num_cells: buffer[25],
            num_temperature_sensors,
            temperatures,
            balance_status: (balance_high << 16) | balance_low,
        })
    }
}

pub struct CellVoltages;

impl CellVoltages {
    pub fn request() -> Vec<u8> {
        read_request(CMD_CELL_VOLTAGES)
    }

    pub fn decode(buffer: &[u8], num_cells: u8) -> Result<Vec<f32>, Error> {
        let n_cells = usize::from(num_cells).min(NUM_CELLS);
        validate_len(buffer, 4 + 2 * n_cells)?;
        let mut result = Vec::with_capacity(n_cells);
        for i in 0..n_cells {
            let volt = u16::from_be_bytes([buffer[4 + 2 * i], buffer[5 + 2 * i]]) as f32 * 0.001;
            log::trace!("Cell #{} volt={}", i + 1, volt);
            result.push(volt);
        }
        Ok(result)
    }
}

pub struct DeviceName;

impl DeviceName {
    pub fn request() -> Vec<u8> {
        read_request(CMD_NAME)
    }

    /// The length byte at offset 3 counts raw characters, copied verbatim.
    /// A zero length yields an empty name.
    pub fn decode(buffer: &[u8]) -> Result<String, Error> {
        validate_len(buffer, 4)?;
        let len = buffer[3] as usize;
        validate_len(buffer, 4 + len)?;
        Ok(buffer[4..4 + len].iter().map(|&b| b as char).collect())
    }
}

pub struct MosfetControl;

impl MosfetControl {
    /// Control frame for the charge/discharge MOSFETs.
    ///
    /// The control field starts with both disable bits set; enabling charge
    /// clears bit 0, enabling discharge clears bit 1, each independently.
    /// The bit-to-function mapping is inferred from captures, not vendor
    /// documentation - verify on hardware before relying on it for a
    /// safety-critical cutoff.
    pub fn request(charge: bool, discharge: bool) -> Vec<u8> {
        let mut bits: u8 = 0b11;
        if charge {
            bits &= 0b10;
        }
        if discharge {
            bits &= 0b01;
        }
        build_frame(WRITE_BYTE, CMD_CTL_MOSFET, &[0x00, bits])
    }
}
