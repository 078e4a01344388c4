//! Our error types for the bench equipment drivers.
//!
//! Each engine carries its own error enum so a caller can always tell a
//! transport failure apart from a device that answered with a complaint,
//! and a timeout apart from a malformed reply.

use thiserror::Error;

use crate::discover::PortCandidate;
use crate::ectypes::EcState;
use crate::telegram::DeviceErrorCode;
use crate::ymodem::YmodemError;

pub type PsuResult<T, I> = core::result::Result<T, PsuError<I>>;
pub type BootloaderResult<T, I> = core::result::Result<T, BootloaderError<I>>;
pub type FieldbusResult<T, E> = core::result::Result<T, FieldbusError<E>>;

/// Errors raised by the EA PSU telegram engine.
#[derive(Error, Debug)]
pub enum PsuError<I: embedded_io::Error> {
    #[error("serial communication error")]
    Serial(I),
    #[error("no response from the PSU within the deadline")]
    Timeout,
    #[error("device reported: {}", .0.message())]
    Device(DeviceErrorCode),
    #[error("malformed response: {0:02X?}")]
    Malformed(Vec<u8>),
    #[error("no valid acknowledge after {0} attempts")]
    NoAck(usize),
    #[error("output {requested} requested but device has {available} controllable output(s)")]
    InvalidOutput { requested: u8, available: u8 },
    #[error("output 2 cannot be addressed while tracking is active")]
    TrackingActive,
    #[error("tracking is only available on multi-output supplies")]
    TrackingUnsupported,
    #[error("nominal value is zero, read the nominal values first")]
    ZeroNominal,
    #[error("internal buffer overflow")]
    Buffer,
}

/// Errors raised by the UART bootloader shell engine.
#[derive(Error, Debug)]
pub enum BootloaderError<I: embedded_io::Error> {
    #[error("serial communication error")]
    Serial(I),
    #[error("no response from the bootloader, device may not be in BOOT mode")]
    Timeout,
    #[error("bootloader does not know command {0:?}")]
    UnknownCommand(String),
    #[error("command {0:?} returned an empty response")]
    CommandFailed(String),
    #[error("file {0:?} is not present on the device")]
    FileMissing(String),
    #[error("received no content for file {0:?}")]
    EmptyFile(String),
    #[error("file transfer failed: {0}")]
    Transfer(YmodemError<I>),
    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
}

impl<I: embedded_io::Error> From<YmodemError<I>> for BootloaderError<I> {
    fn from(error: YmodemError<I>) -> Self {
        Self::Transfer(error)
    }
}

fn list_candidates(found: &[PortCandidate]) -> String {
    let mut text = String::new();
    for (n, candidate) in found.iter().enumerate() {
        text.push_str(&format!("\n{}) {}", n + 1, candidate));
    }
    text
}

fn describe_filter(filter: &Option<String>) -> String {
    match filter {
        Some(f) => format!(" matching {f:?}"),
        None => String::new(),
    }
}

/// Errors raised while looking for a PSU on the host's serial ports.
#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("no PSU found{}", describe_filter(.filter))]
    NotFound { filter: Option<String> },
    #[error("no unique PSU specified, found these PSUs:{}", list_candidates(.0))]
    Ambiguous(Vec<PortCandidate>),
}

/// Everything that can go wrong between "give me a PSU" and a live session.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error(transparent)]
    Discover(#[from] DiscoverError),
    #[error("could not open serial port: {0}")]
    Open(#[from] serialport::Error),
    #[error("PSU did not come up: {0}")]
    Psu(#[from] PsuError<crate::discover::IoError>),
}

/// Errors raised by the fieldbus register/PDO engine.
///
/// `E` is the error type of the underlying [`RegisterTransport`](crate::fieldbus::RegisterTransport)
/// implementation.
#[derive(Error, Debug)]
pub enum FieldbusError<E: core::fmt::Debug + core::fmt::Display> {
    #[error("transport error: {0}")]
    Transport(E),
    #[error("slave did not reach state {0} within {1:?}")]
    StateTimeout(EcState, core::time::Duration),
    #[error("{0}")]
    Step(String),
    #[error("PDO index {0} is invalid, indices start at 1")]
    InvalidPdoIndex(u8),
    #[error("{0:?} is not part of the RPDO mapping")]
    UnknownRpdo(String),
    #[error("PDOs have not been set up for this slave")]
    NoPdoMapping,
    #[error("could not parse {what} from {text:?}")]
    Parse { what: &'static str, text: String },
    #[error("cannot encode {0:?} as {1:?}")]
    Encode(crate::ectypes::EcValue, crate::ectypes::EcType),
    #[error("watchdog time {0} ms is out of range")]
    WatchdogRange(u32),
    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
}
