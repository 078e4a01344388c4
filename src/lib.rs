//! This crate provides the protocol drivers of a motor drive test bench:
//! the EA PS 2000 series programmable power supplies, the servo drives'
//! UART bootloader shell, and the fieldbus register/PDO layer of the
//! drives themselves.
//!
//! All three protocols are half-duplex command/response. Every session
//! object owns its transport exclusively and keeps at most one request in
//! flight; sessions are not re-entrant and must not be shared across
//! threads. One session per physical device, calls serialised through it.
//!
//! The PSU and bootloader engines are written against [embedded_io], so
//! anything that reads and writes bytes can carry them. [discover] opens
//! real serial ports (115200 8N1) and hands back live PSU sessions. The
//! drive layer is written against [fieldbus::RegisterTransport], which the
//! EtherCAT master and the CANopen SDO client both implement.

pub mod bootloader;
pub mod discover;
pub mod ectypes;
pub mod error;
pub mod fieldbus;
pub mod listing;
pub mod objects;
pub mod pdo;
pub mod psu;
pub mod telegram;
pub mod ymodem;

#[cfg(test)]
mod mock_fieldbus;
#[cfg(test)]
mod mock_serial;
