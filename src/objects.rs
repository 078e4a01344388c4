//! The communication object table of the EA PS 2000 series.
//!
//! Every readable or writable quantity on the supply is addressed by a one
//! byte object index. Each object has a fixed payload length and a wire
//! encoding.

/// Wire encoding of an object's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// NUL padded ASCII text.
    AsciiString,
    /// Big-endian IEEE 754 single.
    F32,
    /// Big-endian unsigned 16-bit scaled value.
    U16,
    /// Two independent bytes.
    BytePair,
    /// The 6 byte status block, see [`decode_status`](crate::telegram::decode_status).
    Status,
}

/// One entry of the object table.
#[derive(Debug, Clone, Copy)]
pub struct ObjectEntry {
    pub index: u8,
    /// Payload length in bytes.
    pub len: u8,
    pub kind: ObjectKind,
}

const fn entry(index: u8, len: u8, kind: ObjectKind) -> ObjectEntry {
    ObjectEntry { index, len, kind }
}

/// __R__ - Device type designation, e.g. `PS 2042-06B`.
pub const DEVICE_TYPE: ObjectEntry = entry(0x00, 16, ObjectKind::AsciiString);
/// __R__ - Device serial number.
pub const SERIAL_NUMBER: ObjectEntry = entry(0x01, 16, ObjectKind::AsciiString);
/// __R__ - Nominal output voltage in volts.
pub const NOMINAL_VOLTAGE: ObjectEntry = entry(0x02, 4, ObjectKind::F32);
/// __R__ - Nominal output current in amps.
pub const NOMINAL_CURRENT: ObjectEntry = entry(0x03, 4, ObjectKind::F32);
/// __R__ - Nominal output power in watts.
pub const NOMINAL_POWER: ObjectEntry = entry(0x04, 4, ObjectKind::F32);
/// __R__ - Manufacturer article number.
pub const ARTICLE_NUMBER: ObjectEntry = entry(0x06, 16, ObjectKind::AsciiString);
/// __R__ - Manufacturer name.
pub const MANUFACTURER: ObjectEntry = entry(0x08, 16, ObjectKind::AsciiString);
/// __R__ - Firmware version string.
pub const SOFTWARE_VERSION: ObjectEntry = entry(0x09, 16, ObjectKind::AsciiString);
/// __R__ - Device class. The second byte distinguishes single from triple
/// output models.
pub const DEVICE_CLASS: ObjectEntry = entry(0x13, 2, ObjectKind::BytePair);
/// __R/W__ - Overvoltage protection threshold, scaled.
pub const OVP_THRESHOLD: ObjectEntry = entry(0x26, 2, ObjectKind::U16);
/// __R/W__ - Overcurrent protection threshold, scaled.
pub const OCP_THRESHOLD: ObjectEntry = entry(0x27, 2, ObjectKind::U16);
/// __R/W__ - Voltage setpoint, scaled.
pub const SET_VOLTAGE: ObjectEntry = entry(0x32, 2, ObjectKind::U16);
/// __R/W__ - Current setpoint, scaled.
pub const SET_CURRENT: ObjectEntry = entry(0x33, 2, ObjectKind::U16);
/// __W__ - Control object, takes a mask byte and a command byte.
pub const CONTROL: ObjectEntry = entry(0x36, 2, ObjectKind::BytePair);
/// __R__ - Actual status block: remote flag, status byte, voltage, current.
pub const STATUS_ACTUAL: ObjectEntry = entry(0x47, 6, ObjectKind::Status);
/// __R__ - Target status block, same layout with the setpoints instead of
/// the actual values.
pub const STATUS_TARGET: ObjectEntry = entry(0x48, 6, ObjectKind::Status);

/// `DEVICE_CLASS` second byte for single output models.
pub const DEVICE_CLASS_SINGLE: u8 = 0x10;
/// `DEVICE_CLASS` second byte for triple output models (two controllable).
pub const DEVICE_CLASS_TRIPLE: u8 = 0x18;

/// Control object mask/command pairs.
pub mod control_bits {
    pub const REMOTE_MASK: u8 = 0x10;
    pub const REMOTE_ON: u8 = 0x10;
    pub const REMOTE_OFF: u8 = 0x00;

    pub const OUTPUT_MASK: u8 = 0x01;
    pub const OUTPUT_ON: u8 = 0x01;
    pub const OUTPUT_OFF: u8 = 0x00;

    pub const TRACKING_MASK: u8 = 0xF0;
    pub const TRACKING_ON: u8 = 0xF0;
    pub const TRACKING_OFF: u8 = 0xE0;

    pub const ACK_ALARMS_MASK: u8 = 0x0A;
    pub const ACK_ALARMS: u8 = 0x0A;
}
