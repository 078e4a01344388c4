//! CoE data types, slave states and value encoding for the fieldbus layer.

use strum_macros::EnumIter;

/// CANopen-over-EtherCAT data types, with the codes used in the object
/// dictionary and in PDO mapping entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum EcType {
    Bool,
    I8,
    I16,
    I32,
    U8,
    U16,
    U32,
    F32,
    VisibleString,
    OctetString,
    I64,
    U64,
}

impl EcType {
    pub fn code(&self) -> u16 {
        match self {
            EcType::Bool => 0x01,
            EcType::I8 => 0x02,
            EcType::I16 => 0x03,
            EcType::I32 => 0x04,
            EcType::U8 => 0x05,
            EcType::U16 => 0x06,
            EcType::U32 => 0x07,
            EcType::F32 => 0x08,
            EcType::VisibleString => 0x09,
            EcType::OctetString => 0x0A,
            EcType::I64 => 0x15,
            EcType::U64 => 0x1B,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x01 => EcType::Bool,
            0x02 => EcType::I8,
            0x03 => EcType::I16,
            0x04 => EcType::I32,
            0x05 => EcType::U8,
            0x06 => EcType::U16,
            0x07 => EcType::U32,
            0x08 => EcType::F32,
            0x09 => EcType::VisibleString,
            0x0A => EcType::OctetString,
            0x15 => EcType::I64,
            0x1B => EcType::U64,
            _ => return None,
        })
    }

    /// Wire size in bytes. Strings have no fixed size and report 0.
    pub fn byte_size(&self) -> usize {
        match self {
            EcType::Bool | EcType::I8 | EcType::U8 => 1,
            EcType::I16 | EcType::U16 => 2,
            EcType::I32 | EcType::U32 | EcType::F32 => 4,
            EcType::I64 | EcType::U64 => 8,
            EcType::VisibleString | EcType::OctetString => 0,
        }
    }

    /// Size in bits, as used in PDO mapping entries.
    pub fn bit_size(&self) -> usize {
        self.byte_size() * 8
    }

    /// The integer type of a given width and signedness.
    pub fn from_size(byte_size: usize, signed: bool) -> Option<Self> {
        Some(match (byte_size, signed) {
            (1, false) => EcType::U8,
            (1, true) => EcType::I8,
            (2, false) => EcType::U16,
            (2, true) => EcType::I16,
            (4, false) => EcType::U32,
            (4, true) => EcType::I32,
            (8, false) => EcType::U64,
            (8, true) => EcType::I64,
            _ => return None,
        })
    }

    pub fn signed(&self) -> bool {
        matches!(self, EcType::I8 | EcType::I16 | EcType::I32 | EcType::I64)
    }
}

/// A value crossing the fieldbus, before or after encoding to its CoE type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EcValue {
    Unsigned(u64),
    Signed(i64),
    Float(f32),
}

impl EcValue {
    /// Encode for the wire as the given type, little-endian and truncated
    /// to the type's size. Strings and mismatched variants cannot be
    /// encoded this way.
    pub fn encode(&self, ty: EcType) -> Option<Vec<u8>> {
        let size = ty.byte_size();
        if size == 0 {
            return None;
        }
        let raw: u64 = match (self, ty.signed(), ty) {
            (EcValue::Float(value), _, EcType::F32) => u64::from(value.to_bits()),
            (_, _, EcType::F32) => return None,
            (EcValue::Unsigned(value), false, _) => *value,
            (EcValue::Signed(value), true, _) => *value as u64,
            (EcValue::Signed(value), false, _) if *value >= 0 => *value as u64,
            _ => return None,
        };
        Some(raw.to_le_bytes()[..size].to_vec())
    }

    /// Decode little-endian wire bytes as the given type.
    pub fn decode(ty: EcType, bytes: &[u8]) -> Option<Self> {
        let size = ty.byte_size();
        if size == 0 || bytes.len() < size {
            return None;
        }
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(&bytes[..size]);
        let unsigned = u64::from_le_bytes(raw);
        Some(if ty == EcType::F32 {
            EcValue::Float(f32::from_bits(unsigned as u32))
        } else if ty.signed() {
            // Sign-extend from the type's width.
            let shift = 64 - ty.bit_size();
            EcValue::Signed(((unsigned << shift) as i64) >> shift)
        } else {
            EcValue::Unsigned(unsigned)
        })
    }
}

/// Bit set in the AL status register while the slave flags a state
/// change error.
pub const STATE_ERROR_FLAG: u8 = 0x10;

/// EtherCAT slave states.
///
/// These are the AL states from the EtherCAT state machine. A CANopen
/// transport maps its NMT states onto this set in [`state`] and
/// [`request_state`]: PRE-OPERATIONAL and OPERATIONAL correspond
/// directly, and STOPPED, which has no AL equivalent, reports as
/// [`EcState::Init`].
///
/// [`state`]: crate::fieldbus::RegisterTransport::state
/// [`request_state`]: crate::fieldbus::RegisterTransport::request_state
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum EcState {
    Init,
    PreOp,
    Boot,
    SafeOp,
    Op,
}

impl EcState {
    pub fn code(&self) -> u8 {
        match self {
            EcState::Init => 0x01,
            EcState::PreOp => 0x02,
            EcState::Boot => 0x03,
            EcState::SafeOp => 0x04,
            EcState::Op => 0x08,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => EcState::Init,
            0x02 => EcState::PreOp,
            0x03 => EcState::Boot,
            0x04 => EcState::SafeOp,
            0x08 => EcState::Op,
            _ => return None,
        })
    }

    /// Split a raw AL status byte into the state and the error flag.
    pub fn split(raw: u8) -> (Option<Self>, bool) {
        (
            Self::from_code(raw & !STATE_ERROR_FLAG),
            raw & STATE_ERROR_FLAG != 0,
        )
    }
}

impl core::fmt::Display for EcState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            EcState::Init => "INIT",
            EcState::PreOp => "PREOP",
            EcState::Boot => "BOOT",
            EcState::SafeOp => "SAFEOP",
            EcState::Op => "OP",
        };
        write!(f, "{name}")
    }
}

/// Watchdog registers in the slave controller's register space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogReg {
    Divider = 0x0400,
    Pdi = 0x0410,
    ProcessData = 0x0420,
}

impl WatchdogReg {
    pub fn address(&self) -> u16 {
        *self as u16
    }
}

/// Which watchdog a timeout applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogKind {
    Pdi,
    ProcessData,
}

/// Divider value that makes one watchdog count equal 100 us.
pub const WATCHDOG_DIVIDER: u16 = 2498;

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn type_codes_round_trip() {
        for ty in EcType::iter() {
            assert_eq!(EcType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(EcType::from_code(0x42), None);
    }

    #[test]
    fn integer_types_are_found_by_width() {
        assert_eq!(EcType::from_size(2, true), Some(EcType::I16));
        assert_eq!(EcType::from_size(4, false), Some(EcType::U32));
        assert_eq!(EcType::from_size(3, false), None);
    }

    #[test]
    fn state_codes_round_trip() {
        for state in EcState::iter() {
            assert_eq!(EcState::from_code(state.code()), Some(state));
        }
        assert_eq!(EcState::from_code(0x05), None);
    }

    #[test]
    fn status_byte_carries_an_error_flag() {
        assert_eq!(EcState::split(0x08), (Some(EcState::Op), false));
        assert_eq!(EcState::split(0x11), (Some(EcState::Init), true));
        assert_eq!(EcState::split(0x17), (None, true));
    }

    #[test]
    fn encode_is_little_endian_and_truncating() {
        assert_eq!(
            EcValue::Unsigned(0x1234).encode(EcType::U16),
            Some(vec![0x34, 0x12])
        );
        assert_eq!(
            EcValue::Signed(-2).encode(EcType::I32),
            Some(vec![0xFE, 0xFF, 0xFF, 0xFF])
        );
        assert_eq!(EcValue::Unsigned(1).encode(EcType::VisibleString), None);
        assert_eq!(EcValue::Float(1.0).encode(EcType::U16), None);
    }

    #[test]
    fn decode_sign_extends() {
        assert_eq!(
            EcValue::decode(EcType::I16, &[0xFE, 0xFF]),
            Some(EcValue::Signed(-2))
        );
        assert_eq!(
            EcValue::decode(EcType::U16, &[0xFE, 0xFF]),
            Some(EcValue::Unsigned(0xFFFE))
        );
        assert_eq!(EcValue::decode(EcType::U32, &[0x01, 0x02]), None);
    }

    #[test]
    fn floats_cross_the_wire_by_bit_pattern() {
        let encoded = EcValue::Float(1.5).encode(EcType::F32).unwrap();
        assert_eq!(EcValue::decode(EcType::F32, &encoded), Some(EcValue::Float(1.5)));
    }

    #[test]
    fn nonnegative_signed_fits_unsigned_types() {
        assert_eq!(
            EcValue::Signed(7).encode(EcType::U8),
            Some(vec![0x07])
        );
        assert_eq!(EcValue::Signed(-7).encode(EcType::U8), None);
    }
}
