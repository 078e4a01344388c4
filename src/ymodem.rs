//! Minimal YMODEM implementation in CRC mode.
//!
//! This covers the single file batch transfers the bootloader shell speaks:
//! a name/size header in block 0, 1k data blocks, the double EOT handshake
//! and a closing null header. Checksum fallback mode is not supported, the
//! receiver always requests CRC-16.

use std::thread;
use std::time::{Duration, Instant};

use embedded_io::Error;
use log::{debug, trace};
use thiserror::Error as ThisError;

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
/// Sent by the receiver to request CRC-16 mode.
pub const CRC_REQUEST: u8 = b'C';
/// CP/M style padding for the tail of the last data block.
pub const PAD_BYTE: u8 = 0x1A;

/// Payload length of a SOH block.
pub const SHORT_BLOCK_LEN: usize = 128;
/// Payload length of a STX block.
pub const LONG_BLOCK_LEN: usize = 1024;
/// How often a block is re-sent or re-requested before giving up.
pub const BLOCK_RETRIES: usize = 10;

/// Errors raised during a YMODEM transfer.
#[derive(ThisError, Debug)]
pub enum YmodemError<I: embedded_io::Error> {
    #[error("serial communication error")]
    Serial(I),
    #[error("no data from the peer within the deadline")]
    Timeout,
    #[error("transfer cancelled by the peer")]
    Cancelled,
    #[error("block was not transferred after {0} attempts")]
    RetriesExhausted(usize),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

/// CRC-16/XMODEM: polynomial 0x1021, initial value 0.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |mut crc, &byte| {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
        crc
    })
}

fn read_byte<S: embedded_io::Read>(
    link: &mut S,
    deadline: Instant,
) -> Result<u8, YmodemError<S::Error>> {
    let mut byte = [0u8; 1];
    loop {
        match link.read(&mut byte) {
            Ok(0) => {}
            Ok(_) => return Ok(byte[0]),
            Err(e) => match e.kind() {
                embedded_io::ErrorKind::Other | embedded_io::ErrorKind::TimedOut => {}
                _ => return Err(YmodemError::Serial(e)),
            },
        }
        if Instant::now() >= deadline {
            return Err(YmodemError::Timeout);
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn read_exact<S: embedded_io::Read>(
    link: &mut S,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<(), YmodemError<S::Error>> {
    let mut filled = 0;
    while filled < buf.len() {
        match link.read(&mut buf[filled..]) {
            Ok(0) => {}
            Ok(bytes_read) => filled += bytes_read,
            Err(e) => match e.kind() {
                embedded_io::ErrorKind::Other | embedded_io::ErrorKind::TimedOut => {}
                _ => return Err(YmodemError::Serial(e)),
            },
        }
        if filled < buf.len() && Instant::now() >= deadline {
            return Err(YmodemError::Timeout);
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

/// Read bytes until `wanted` shows up. Two consecutive CAN bytes abort.
fn await_byte<S: embedded_io::Read>(
    link: &mut S,
    wanted: u8,
    deadline: Instant,
) -> Result<(), YmodemError<S::Error>> {
    let mut cancels = 0;
    loop {
        let byte = read_byte(link, deadline)?;
        if byte == wanted {
            return Ok(());
        }
        if byte == CAN {
            cancels += 1;
            if cancels >= 2 {
                return Err(YmodemError::Cancelled);
            }
        } else {
            cancels = 0;
        }
    }
}

fn send_block<S: embedded_io::Read + embedded_io::Write>(
    link: &mut S,
    block_num: u8,
    payload: &[u8],
    deadline: Instant,
) -> Result<(), YmodemError<S::Error>> {
    let marker = if payload.len() == LONG_BLOCK_LEN {
        STX
    } else {
        SOH
    };
    let crc = crc16(payload);
    for attempt in 1..=BLOCK_RETRIES {
        link.write_all(&[marker, block_num, !block_num])
            .map_err(YmodemError::Serial)?;
        link.write_all(payload).map_err(YmodemError::Serial)?;
        link.write_all(&crc.to_be_bytes())
            .map_err(YmodemError::Serial)?;
        match read_byte(link, deadline)? {
            ACK => return Ok(()),
            CAN => {
                if read_byte(link, deadline)? == CAN {
                    return Err(YmodemError::Cancelled);
                }
            }
            other => {
                trace!("block {block_num} not accepted (0x{other:02X}), attempt {attempt}/{BLOCK_RETRIES}");
            }
        }
    }
    Err(YmodemError::RetriesExhausted(BLOCK_RETRIES))
}

/// Send one file. Returns the number of payload bytes transferred.
pub fn send<S: embedded_io::Read + embedded_io::Write>(
    link: &mut S,
    name: &str,
    data: &[u8],
    timeout: Duration,
) -> Result<usize, YmodemError<S::Error>> {
    let deadline = Instant::now() + timeout;
    debug!("ymodem send of {name:?}, {} bytes", data.len());

    await_byte(link, CRC_REQUEST, deadline)?;

    // Block 0 carries "<name>\0<size in decimal>".
    let mut header = [0u8; SHORT_BLOCK_LEN];
    let name_bytes = name.as_bytes();
    let name_len = name_bytes.len().min(SHORT_BLOCK_LEN - 2);
    header[..name_len].copy_from_slice(&name_bytes[..name_len]);
    let size_text = data.len().to_string();
    let size_start = name_len + 1;
    let size_len = size_text.len().min(SHORT_BLOCK_LEN - size_start);
    header[size_start..size_start + size_len]
        .copy_from_slice(&size_text.as_bytes()[..size_len]);
    send_block(link, 0, &header, deadline)?;

    await_byte(link, CRC_REQUEST, deadline)?;

    let mut block_num: u8 = 1;
    for chunk in data.chunks(LONG_BLOCK_LEN) {
        let mut block = [PAD_BYTE; LONG_BLOCK_LEN];
        block[..chunk.len()].copy_from_slice(chunk);
        send_block(link, block_num, &block, deadline)?;
        block_num = block_num.wrapping_add(1);
    }

    // Double EOT handshake: the receiver NAKs the first EOT and ACKs the
    // repeat. Some receivers skip the dance and ACK straight away.
    link.write_all(&[EOT]).map_err(YmodemError::Serial)?;
    if read_byte(link, deadline)? != ACK {
        link.write_all(&[EOT]).map_err(YmodemError::Serial)?;
        await_byte(link, ACK, deadline)?;
    }

    // A null header closes the batch.
    await_byte(link, CRC_REQUEST, deadline)?;
    send_block(link, 0, &[0u8; SHORT_BLOCK_LEN], deadline)?;

    Ok(data.len())
}

enum Incoming {
    Block(u8, Vec<u8>),
    Eot,
}

/// Collect the next block, NAKing garbled ones until the retry budget runs
/// out. Returns on EOT without consuming anything further.
fn recv_block<S: embedded_io::Read + embedded_io::Write>(
    link: &mut S,
    deadline: Instant,
) -> Result<Incoming, YmodemError<S::Error>> {
    let mut bad_blocks = 0;
    let mut cancels = 0;
    loop {
        let marker = read_byte(link, deadline)?;
        let payload_len = match marker {
            SOH => SHORT_BLOCK_LEN,
            STX => LONG_BLOCK_LEN,
            EOT => return Ok(Incoming::Eot),
            CAN => {
                cancels += 1;
                if cancels >= 2 {
                    return Err(YmodemError::Cancelled);
                }
                continue;
            }
            _ => continue,
        };
        cancels = 0;

        let mut numbering = [0u8; 2];
        read_exact(link, &mut numbering, deadline)?;
        let mut payload = vec![0u8; payload_len];
        read_exact(link, &mut payload, deadline)?;
        let mut crc_bytes = [0u8; 2];
        read_exact(link, &mut crc_bytes, deadline)?;

        let [block_num, complement] = numbering;
        let crc_ok = crc16(&payload) == u16::from_be_bytes(crc_bytes);
        if complement == !block_num && crc_ok {
            return Ok(Incoming::Block(block_num, payload));
        }

        debug!("garbled block {block_num}, requesting retransmission");
        link.write_all(&[NAK]).map_err(YmodemError::Serial)?;
        bad_blocks += 1;
        if bad_blocks >= BLOCK_RETRIES {
            return Err(YmodemError::RetriesExhausted(BLOCK_RETRIES));
        }
    }
}

/// Receive one file. Returns the name from the header block and the content
/// truncated to the advertised size.
pub fn recv<S: embedded_io::Read + embedded_io::Write>(
    link: &mut S,
    timeout: Duration,
) -> Result<(String, Vec<u8>), YmodemError<S::Error>> {
    let deadline = Instant::now() + timeout;

    link.write_all(&[CRC_REQUEST]).map_err(YmodemError::Serial)?;
    let (header_num, header) = match recv_block(link, deadline)? {
        Incoming::Block(num, payload) => (num, payload),
        Incoming::Eot => return Err(YmodemError::Protocol("EOT before the file header")),
    };
    if header_num != 0 {
        return Err(YmodemError::Protocol("transfer did not start with block 0"));
    }
    let (name, size) = parse_header(&header);
    link.write_all(&[ACK]).map_err(YmodemError::Serial)?;
    if name.is_empty() {
        // An empty header means the sender has nothing to offer.
        return Ok((name, Vec::new()));
    }
    debug!("ymodem receive of {name:?}, {size} bytes advertised");
    link.write_all(&[CRC_REQUEST]).map_err(YmodemError::Serial)?;

    let mut content: Vec<u8> = Vec::new();
    let mut expected: u8 = 1;
    loop {
        match recv_block(link, deadline)? {
            Incoming::Eot => {
                link.write_all(&[NAK]).map_err(YmodemError::Serial)?;
                if read_byte(link, deadline)? == EOT {
                    link.write_all(&[ACK]).map_err(YmodemError::Serial)?;
                }
                break;
            }
            Incoming::Block(block_num, payload) => {
                if block_num == expected {
                    content.extend_from_slice(&payload);
                    expected = expected.wrapping_add(1);
                }
                // Duplicates from a lost ACK are dropped, but acknowledged.
                link.write_all(&[ACK]).map_err(YmodemError::Serial)?;
            }
        }
    }

    // The closing null header ends the batch.
    link.write_all(&[CRC_REQUEST]).map_err(YmodemError::Serial)?;
    if let Incoming::Block(_, _) = recv_block(link, deadline)? {
        link.write_all(&[ACK]).map_err(YmodemError::Serial)?;
    }

    if size > 0 && content.len() > size {
        content.truncate(size);
    }
    Ok((name, content))
}

/// Split the header block into file name and advertised size.
fn parse_header(header: &[u8]) -> (String, usize) {
    let name_len = header
        .iter()
        .position(|&byte| byte == 0)
        .unwrap_or(header.len());
    let name = String::from_utf8_lossy(&header[..name_len]).to_string();
    let rest = &header[(name_len + 1).min(header.len())..];
    let size_len = rest
        .iter()
        .position(|&byte| byte == 0 || byte == b' ')
        .unwrap_or(rest.len());
    let size = String::from_utf8_lossy(&rest[..size_len])
        .parse::<usize>()
        .unwrap_or(0);
    (name, size)
}
