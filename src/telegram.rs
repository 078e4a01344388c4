//! Framing, checksum and payload codecs for the EA PS 2000 telegram protocol.
//!
//! A telegram on the wire looks like this:
//!
//! `[start delimiter, output number, object index, payload ..., checksum hi, checksum lo]`
//!
//! The start delimiter carries the message type in its upper nibble and the
//! payload length minus one in its lower nibble. The checksum is the 16-bit
//! arithmetic sum over all preceding bytes, appended high byte first.

use modular_bitfield::prelude::*;
use strum_macros::EnumIter;

/// Message type bits of the start delimiter.
pub const SEND_MSG: u8 = 0xC0;
pub const RECEIVE_MSG: u8 = 0x40;
pub const CAST_TYPE: u8 = 0x20;
pub const DIRECTION_MSG: u8 = 0x10;

/// Start delimiter base for telegrams written to the device.
pub const SEND_HEADER: u8 = SEND_MSG + CAST_TYPE + DIRECTION_MSG;
/// Start delimiter base for query telegrams.
pub const RECEIVE_HEADER: u8 = RECEIVE_MSG + CAST_TYPE + DIRECTION_MSG;

/// Object index of the control object used for remote/output/tracking commands.
pub const CONTROL_OBJECT: u8 = 0x36;

/// Longest telegram is 3 header bytes + 16 payload bytes + 2 checksum bytes.
pub const MAX_TELEGRAM_LEN: usize = 21;

/// Actual and set values are expressed as a fraction of the nominal value,
/// scaled by this factor.
pub const SCALING_FACTOR: f32 = 25600.0;

/// 16-bit arithmetic checksum over a byte slice.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |sum, &byte| sum.wrapping_add(byte as u16))
}

fn assemble(
    header: u8,
    output: u8,
    object: u8,
    payload: &[u8],
) -> heapless::Vec<u8, MAX_TELEGRAM_LEN> {
    let mut telegram: heapless::Vec<u8, MAX_TELEGRAM_LEN> = heapless::Vec::new();
    // Capacity covers the longest object, so these pushes cannot fail.
    let _ = telegram.push(header);
    let _ = telegram.push(output);
    let _ = telegram.push(object);
    let _ = telegram.extend_from_slice(payload);
    let sum = checksum(&telegram);
    let _ = telegram.push((sum >> 8) as u8);
    let _ = telegram.push(sum as u8);
    telegram
}

/// Build a query telegram for the given object.
pub fn query(
    object: &crate::objects::ObjectEntry,
    output: u8,
) -> heapless::Vec<u8, MAX_TELEGRAM_LEN> {
    assemble(RECEIVE_HEADER + object.len - 1, output, object.index, &[])
}

/// Build a query telegram without a length hint in the start delimiter.
///
/// The nominal value objects are queried this way.
pub fn query_bare(
    object: &crate::objects::ObjectEntry,
    output: u8,
) -> heapless::Vec<u8, MAX_TELEGRAM_LEN> {
    assemble(RECEIVE_HEADER, output, object.index, &[])
}

/// Build a telegram writing `payload` to the given object.
pub fn set(
    object: &crate::objects::ObjectEntry,
    output: u8,
    payload: &[u8],
) -> heapless::Vec<u8, MAX_TELEGRAM_LEN> {
    assemble(
        SEND_HEADER + payload.len() as u8 - 1,
        output,
        object.index,
        payload,
    )
}

/// Build a control telegram carrying a mask byte and a command byte.
pub fn control(output: u8, mask: u8, command: u8) -> heapless::Vec<u8, MAX_TELEGRAM_LEN> {
    assemble(SEND_HEADER + 1, output, CONTROL_OBJECT, &[mask, command])
}

/// Strip the 3 header bytes and 2 checksum bytes off a received telegram.
///
/// Returns `None` when the telegram is too short to contain a payload.
pub fn strip(response: &[u8]) -> Option<&[u8]> {
    if response.len() < 6 {
        return None;
    }
    Some(&response[3..response.len() - 2])
}

/// Scale a physical value to the raw wire representation.
pub fn to_raw(value: f32, nominal: f32) -> u32 {
    (value * SCALING_FACTOR / nominal) as u32
}

/// Scale a raw wire value back to a physical value, rounded to 3 decimals.
pub fn from_raw(raw: u16, nominal: f32) -> f32 {
    ((raw as f32) * nominal / SCALING_FACTOR * 1000.0).round() / 1000.0
}

/// Error codes the device can answer with.
///
/// The messages mirror the wording of the device manual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
#[repr(u8)]
pub enum DeviceErrorCode {
    NoError = 0x00,
    ChecksumWrong = 0x03,
    StartDelimiterWrong = 0x04,
    WrongOutput = 0x05,
    ObjectUndefined = 0x07,
    ObjectLengthIncorrect = 0x08,
    NoRwAccess = 0x09,
    DeviceInLockState = 0x0F,
    UpperLimitExceeded = 0x30,
    LowerLimitExceeded = 0x31,
}

impl DeviceErrorCode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        use DeviceErrorCode as E;
        match raw {
            0x00 => Some(E::NoError),
            0x03 => Some(E::ChecksumWrong),
            0x04 => Some(E::StartDelimiterWrong),
            0x05 => Some(E::WrongOutput),
            0x07 => Some(E::ObjectUndefined),
            0x08 => Some(E::ObjectLengthIncorrect),
            0x09 => Some(E::NoRwAccess),
            0x0F => Some(E::DeviceInLockState),
            0x30 => Some(E::UpperLimitExceeded),
            0x31 => Some(E::LowerLimitExceeded),
            _ => None,
        }
    }

    /// The error text as printed in the device manual.
    pub fn message(&self) -> &'static str {
        use DeviceErrorCode as E;
        match self {
            E::NoError => "NO ERROR",
            E::ChecksumWrong => "CHECKSUM WRONG",
            E::StartDelimiterWrong => "STARTDELIMITER WRONG",
            E::WrongOutput => "WRONG OUTPUT",
            E::ObjectUndefined => "OBJECT UNDEFINED",
            E::ObjectLengthIncorrect => "OBJECT LENGTH INCORRECT",
            E::NoRwAccess => "NO RW ACCESS",
            E::DeviceInLockState => "DEVICE IN LOCK STATE",
            E::UpperLimitExceeded => "UPPER LIMIT OF OBJECT EXCEEDED",
            E::LowerLimitExceeded => "LOWER LIMIT OF OBJECT EXCEEDED",
        }
    }
}

impl core::fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Decoded single-byte acknowledge payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// Command accepted.
    Accepted,
    /// Device answered with one of its error codes.
    Rejected(DeviceErrorCode),
    /// Payload was not a recognisable acknowledge.
    Malformed(Vec<u8>),
}

/// Interpret an acknowledge payload.
pub fn decode_ack(payload: &[u8]) -> Ack {
    if payload.len() != 1 {
        return Ack::Malformed(payload.to_vec());
    }
    match DeviceErrorCode::from_raw(payload[0]) {
        Some(DeviceErrorCode::NoError) => Ack::Accepted,
        Some(code) => Ack::Rejected(code),
        None => Ack::Malformed(payload.to_vec()),
    }
}

/// The device status byte inside the actual/target status objects.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct StatusBits {
    pub output_on: bool,
    pub controller: B2,
    pub tracking_active: bool,
    pub ovp_active: bool,
    pub ocp_active: bool,
    pub opp_active: bool,
    pub otp_active: bool,
}

/// Represents the two possible power supply regulation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerMode {
    /// Constant voltage regulation mode.
    #[default]
    Cv,
    /// Constant current regulation mode.
    Cc,
}

impl From<StatusBits> for ControllerMode {
    fn from(bits: StatusBits) -> Self {
        if bits.controller() == 0 {
            ControllerMode::Cv
        } else {
            ControllerMode::Cc
        }
    }
}

/// Decoded payload of the `STATUS_ACTUAL`/`STATUS_TARGET` objects.
///
/// Voltage and current are still in raw scaled form, the session layer
/// converts them using the nominal values.
#[derive(Debug, Clone, Copy)]
pub struct RawStatus {
    pub remote_on: bool,
    pub bits: StatusBits,
    pub voltage_raw: u16,
    pub current_raw: u16,
}

/// Decode a 6 byte status payload. Layout is big-endian `u8 u8 u16 u16`.
pub fn decode_status(payload: &[u8]) -> Option<RawStatus> {
    if payload.len() < 6 {
        return None;
    }
    Some(RawStatus {
        remote_on: payload[0] == 0x01,
        bits: StatusBits::from_bytes([payload[1]]),
        voltage_raw: u16::from_be_bytes([payload[2], payload[3]]),
        current_raw: u16::from_be_bytes([payload[4], payload[5]]),
    })
}
