//! Finding an EA PSU among the host's serial ports and opening a session.
//!
//! The supplies enumerate as USB CDC devices with the EA vendor id, so a
//! bench with several of them needs a way to say which one is meant. A
//! [`Selector`] narrows the candidates down, and refusing to guess between
//! several matches is deliberate.

use std::time::Duration;

use log::info;
use serialport::{SerialPort, SerialPortType};

use crate::error::{ConnectError, DiscoverError};
use crate::psu::EaPsu;

/// USB vendor id of Elektro-Automatik.
pub const VENDOR_ID: u16 = 0x232e;
/// Product id of the single-output supplies. Everything else with the EA
/// vendor id is a triple-output model.
pub const PRODUCT_ID_SINGLE: u16 = 0x0010;

const BAUD_RATE: u32 = 115200;
/// Receive timeout of the port itself. Response deadlines are enforced on
/// top of this by the engine.
const PORT_TIMEOUT: Duration = Duration::from_millis(50);

/// A serial port that looks like an EA PSU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    /// Port path, e.g. `/dev/ttyACM0`.
    pub port: String,
    /// USB product string.
    pub description: String,
    /// USB serial number.
    pub serial_number: String,
    /// Output count as advertised by the USB product id.
    pub outputs: u8,
}

impl core::fmt::Display for PortCandidate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}, SN: {}, Outputs: {}, Port: {}",
            self.description, self.serial_number, self.outputs, self.port
        )
    }
}

/// How to pick a PSU out of the candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Take whatever is there, as long as it is unique.
    Any,
    /// A concrete port path.
    Path(String),
    /// The USB serial number of the supply.
    SerialNumber(String),
    /// A substring of the USB product string, e.g. a model designator
    /// like "PS 2042-06B".
    Designator(String),
}

impl Selector {
    fn matches(&self, candidate: &PortCandidate) -> bool {
        match self {
            Selector::Any => true,
            Selector::Path(path) => candidate.port == *path,
            Selector::SerialNumber(serial) => candidate.serial_number == *serial,
            Selector::Designator(designator) => candidate.description.contains(designator),
        }
    }

    fn filter_description(&self) -> Option<String> {
        match self {
            Selector::Any => None,
            Selector::Path(path) => Some(path.clone()),
            Selector::SerialNumber(serial) => Some(serial.clone()),
            Selector::Designator(designator) => Some(designator.clone()),
        }
    }
}

/// All EA supplies currently attached to the host.
pub fn candidates() -> Result<Vec<PortCandidate>, serialport::Error> {
    let mut found = Vec::new();
    for port in serialport::available_ports()? {
        let SerialPortType::UsbPort(usb) = port.port_type else {
            continue;
        };
        if usb.vid != VENDOR_ID {
            continue;
        }
        let outputs = if usb.pid == PRODUCT_ID_SINGLE { 1 } else { 3 };
        found.push(PortCandidate {
            port: port.port_name,
            description: usb.product.unwrap_or_default(),
            serial_number: usb.serial_number.unwrap_or_default(),
            outputs,
        });
    }
    Ok(found)
}

/// Pick the unique candidate matching the selector.
pub fn select<'a>(
    selector: &Selector,
    found: &'a [PortCandidate],
) -> Result<&'a PortCandidate, DiscoverError> {
    let matching: Vec<&PortCandidate> = found
        .iter()
        .filter(|candidate| selector.matches(candidate))
        .collect();
    match matching.as_slice() {
        [] => Err(DiscoverError::NotFound {
            filter: selector.filter_description(),
        }),
        [unique] => Ok(unique),
        _ => Err(DiscoverError::Ambiguous(
            matching.into_iter().cloned().collect(),
        )),
    }
}

/// [std::io::Error] dressed up for [embedded_io].
#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::ConnectionRefused => embedded_io::ErrorKind::ConnectionRefused,
            std::io::ErrorKind::ConnectionReset => embedded_io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::ConnectionAborted => embedded_io::ErrorKind::ConnectionAborted,
            std::io::ErrorKind::NotConnected => embedded_io::ErrorKind::NotConnected,
            std::io::ErrorKind::AddrInUse => embedded_io::ErrorKind::AddrInUse,
            std::io::ErrorKind::AddrNotAvailable => embedded_io::ErrorKind::AddrNotAvailable,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::AlreadyExists => embedded_io::ErrorKind::AlreadyExists,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            std::io::ErrorKind::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

/// An open serial port adapted to the [embedded_io] traits the engines
/// are written against.
pub struct SerialLink(Box<dyn SerialPort>);

impl embedded_io::ErrorType for SerialLink {
    type Error = IoError;
}

impl embedded_io::Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(IoError)
    }
}

impl embedded_io::Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(IoError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(IoError)
    }
}

/// Find the PSU matching the selector, open it and bring the session up.
///
/// The returned session has already read the device description and the
/// current status, so callers can go straight to setpoints.
pub fn connect(selector: &Selector) -> Result<EaPsu<SerialLink>, ConnectError> {
    let found = candidates()?;
    let candidate = select(selector, &found)?;
    info!("connecting to {candidate}");

    let port = serialport::new(&candidate.port, BAUD_RATE)
        .timeout(PORT_TIMEOUT)
        .open()?;
    let mut psu = EaPsu::new(SerialLink(port));
    psu.get_device_description(true)?;
    psu.get_status(true)?;
    Ok(psu)
}
