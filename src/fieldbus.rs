//! Register, state machine and file layer for the servo drives on the
//! fieldbus.
//!
//! The drives sit on either EtherCAT or CANopen, and both stacks expose the
//! same operation surface. [`RegisterTransport`] is that surface; everything
//! in this module is written against it, so the EtherCAT master and the
//! CANopen SDO client only differ in how they put bytes on the wire.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::ectypes::{EcState, EcType, EcValue, WATCHDOG_DIVIDER, WatchdogKind, WatchdogReg};
use crate::error::{FieldbusError, FieldbusResult};
use crate::listing::{self, FilesystemInfo};
use crate::pdo::PdoMapping;

/// How long a slave gets to complete one state transition.
pub const DEFAULT_STATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting for a state transition.
const STATE_POLL: Duration = Duration::from_millis(10);
/// Attempts for one SDO access before the transport error is surfaced.
const SDO_RETRIES: usize = 3;

/// One fieldbus stack, reduced to the operations the drives need.
///
/// Implemented once over the EtherCAT master and once over the CANopen SDO
/// client. All addressing is per slave; `slave` is the position on the bus.
pub trait RegisterTransport {
    type Error: core::fmt::Debug + core::fmt::Display;

    /// Read raw bytes from the slave controller's register space.
    fn reg_read(&mut self, slave: u32, address: u16, len: usize) -> Result<Vec<u8>, Self::Error>;
    /// Write raw bytes into the slave controller's register space.
    fn reg_write(&mut self, slave: u32, address: u16, data: &[u8]) -> Result<(), Self::Error>;
    /// Read an object dictionary entry.
    fn sdo_upload(&mut self, slave: u32, index: u16, subindex: u8) -> Result<Vec<u8>, Self::Error>;
    /// Write an object dictionary entry.
    fn sdo_download(
        &mut self,
        slave: u32,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), Self::Error>;
    /// Fetch a file, or the answer to a file-surface command, by name.
    fn file_read(&mut self, slave: u32, name: &str) -> Result<Vec<u8>, Self::Error>;
    /// Ship a file, or a file-surface command, by name.
    fn file_write(&mut self, slave: u32, name: &str, data: &[u8]) -> Result<(), Self::Error>;
    /// Raw AL status byte of the slave.
    fn state(&mut self, slave: u32) -> Result<u8, Self::Error>;
    /// Ask the slave to move to a state. Completion is observed via
    /// [`state`](Self::state), not implied by this returning.
    fn request_state(&mut self, slave: u32, state: EcState) -> Result<(), Self::Error>;
    /// One process data cycle: put `outputs` on the bus, get the inputs back.
    fn pdo_exchange(&mut self, slave: u32, outputs: &[u8]) -> Result<Vec<u8>, Self::Error>;
}

/// A session with the drives on one fieldbus.
pub struct EcNode<T: RegisterTransport> {
    pub(crate) transport: T,
    state_timeout: Duration,
    pub(crate) pdo: std::collections::BTreeMap<u32, PdoMapping>,
}

impl<T: RegisterTransport> EcNode<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state_timeout: DEFAULT_STATE_TIMEOUT,
            pdo: std::collections::BTreeMap::new(),
        }
    }

    /// Override the deadline for a single state transition.
    pub fn set_state_timeout(&mut self, timeout: Duration) {
        self.state_timeout = timeout;
    }

    /// Raw typed register read.
    pub fn reg_read(&mut self, slave: u32, address: u16, len: usize) -> FieldbusResult<Vec<u8>, T::Error> {
        self.transport
            .reg_read(slave, address, len)
            .map_err(FieldbusError::Transport)
    }

    /// Raw typed register write.
    pub fn reg_write(
        &mut self,
        slave: u32,
        address: u16,
        value: EcValue,
        ty: EcType,
    ) -> FieldbusResult<(), T::Error> {
        let data = value.encode(ty).ok_or(FieldbusError::Encode(value, ty))?;
        self.transport
            .reg_write(slave, address, &data)
            .map_err(FieldbusError::Transport)
    }

    /// Current slave state plus the AL error flag.
    pub fn get_state(&mut self, slave: u32) -> FieldbusResult<(Option<EcState>, bool), T::Error> {
        let raw = self.transport.state(slave).map_err(FieldbusError::Transport)?;
        Ok(EcState::split(raw))
    }

    /// Request one transition and wait for the slave to arrive.
    fn change_state(&mut self, slave: u32, target: EcState) -> FieldbusResult<(), T::Error> {
        self.transport
            .request_state(slave, target)
            .map_err(FieldbusError::Transport)?;
        let deadline = Instant::now() + self.state_timeout;
        loop {
            let (current, _) = self.get_state(slave)?;
            if current == Some(target) {
                debug!("slave {slave} reached {target}");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FieldbusError::StateTimeout(target, self.state_timeout));
            }
            thread::sleep(STATE_POLL);
        }
    }

    /// Walk the slave's state machine to `target`.
    ///
    /// BOOT is only reachable from INIT, and a slave sitting in BOOT must
    /// pass through INIT again before any other state. OP is reached by
    /// climbing PREOP and SAFEOP in order.
    pub fn set_state(&mut self, slave: u32, target: EcState) -> FieldbusResult<(), T::Error> {
        let (current, _) = self.get_state(slave)?;
        if current == Some(target) {
            return Ok(());
        }

        let mut ladder: Vec<EcState> = Vec::new();
        if current == Some(EcState::Boot) || target == EcState::Boot {
            ladder.push(EcState::Init);
        }
        match target {
            EcState::Init => {
                if ladder.is_empty() {
                    ladder.push(EcState::Init);
                }
            }
            EcState::Boot => ladder.push(EcState::Boot),
            EcState::PreOp => ladder.push(EcState::PreOp),
            EcState::SafeOp => ladder.extend([EcState::PreOp, EcState::SafeOp]),
            EcState::Op => ladder.extend([EcState::PreOp, EcState::SafeOp, EcState::Op]),
        }

        for step in ladder {
            self.change_state(slave, step)?;
        }
        Ok(())
    }

    /// Configure one of the slave's watchdogs.
    ///
    /// The divider is pinned so one watchdog count equals 100 us, which
    /// makes the count ten times the requested milliseconds.
    pub fn set_watchdog(
        &mut self,
        slave: u32,
        kind: WatchdogKind,
        time_ms: u32,
    ) -> FieldbusResult<(), T::Error> {
        let counts = time_ms * 10;
        let counts: u16 = counts
            .try_into()
            .map_err(|_| FieldbusError::WatchdogRange(time_ms))?;
        let reg = match kind {
            WatchdogKind::Pdi => WatchdogReg::Pdi,
            WatchdogKind::ProcessData => WatchdogReg::ProcessData,
        };
        info!("slave {slave}: {kind:?} watchdog to {time_ms} ms");
        self.transport
            .reg_write(slave, WatchdogReg::Divider.address(), &WATCHDOG_DIVIDER.to_le_bytes())
            .map_err(FieldbusError::Transport)?;
        self.transport
            .reg_write(slave, reg.address(), &counts.to_le_bytes())
            .map_err(FieldbusError::Transport)
    }

    /// Read an object dictionary entry as the given type.
    pub fn sdo_upload(
        &mut self,
        slave: u32,
        index: u16,
        subindex: u8,
        ty: EcType,
    ) -> FieldbusResult<EcValue, T::Error> {
        let bytes = self.sdo_upload_raw(slave, index, subindex)?;
        EcValue::decode(ty, &bytes).ok_or_else(|| FieldbusError::Parse {
            what: "SDO value",
            text: format!("{bytes:02X?}"),
        })
    }

    /// Write a typed value into the object dictionary.
    pub fn sdo_download(
        &mut self,
        slave: u32,
        index: u16,
        subindex: u8,
        value: EcValue,
        ty: EcType,
    ) -> FieldbusResult<(), T::Error> {
        let data = value.encode(ty).ok_or(FieldbusError::Encode(value, ty))?;
        self.sdo_download_raw(slave, index, subindex, &data)
    }

    pub(crate) fn sdo_upload_raw(
        &mut self,
        slave: u32,
        index: u16,
        subindex: u8,
    ) -> FieldbusResult<Vec<u8>, T::Error> {
        for attempt in 1..SDO_RETRIES {
            match self.transport.sdo_upload(slave, index, subindex) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    debug!("SDO upload {index:#06X}:{subindex} attempt {attempt}/{SDO_RETRIES}: {e}");
                }
            }
        }
        self.transport
            .sdo_upload(slave, index, subindex)
            .map_err(FieldbusError::Transport)
    }

    pub(crate) fn sdo_download_raw(
        &mut self,
        slave: u32,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> FieldbusResult<(), T::Error> {
        for attempt in 1..SDO_RETRIES {
            match self.transport.sdo_download(slave, index, subindex, data) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("SDO download {index:#06X}:{subindex} attempt {attempt}/{SDO_RETRIES}: {e}");
                }
            }
        }
        self.transport
            .sdo_download(slave, index, subindex, data)
            .map_err(FieldbusError::Transport)
    }

    fn file_command_text(&mut self, slave: u32, command: &str) -> FieldbusResult<String, T::Error> {
        let bytes = self
            .transport
            .file_read(slave, command)
            .map_err(FieldbusError::Transport)?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    /// List the files on the slave, name to size in bytes.
    pub fn fs_list(
        &mut self,
        slave: u32,
    ) -> FieldbusResult<std::collections::BTreeMap<String, u32>, T::Error> {
        let text = self.file_command_text(slave, "fs-getlist")?;
        Ok(listing::parse_file_list(&text))
    }

    /// Free/used/total counters of the slave's filesystem.
    pub fn fs_info(&mut self, slave: u32) -> FieldbusResult<FilesystemInfo, T::Error> {
        let text = self.file_command_text(slave, "fs-info")?;
        listing::parse_fs_info(&text).ok_or(FieldbusError::Parse {
            what: "filesystem counters",
            text,
        })
    }

    /// Delete a file from the slave's filesystem.
    pub fn fs_remove(&mut self, slave: u32, name: &str) -> FieldbusResult<(), T::Error> {
        info!("slave {slave}: remove {name:?}");
        self.transport
            .file_write(slave, &format!("fs-remove={name}"), &[])
            .map_err(FieldbusError::Transport)
    }

    /// Unlock the protected part of the slave's filesystem.
    pub fn fs_unlock(&mut self, slave: u32, password: &str) -> FieldbusResult<(), T::Error> {
        self.transport
            .file_write(slave, &format!("fs-stackunlock={password}"), &[])
            .map_err(FieldbusError::Transport)
    }

    /// Help text of the file surface.
    pub fn fs_help(&mut self, slave: u32) -> FieldbusResult<String, T::Error> {
        self.file_command_text(slave, "fs-help")
    }

    /// Bootloader version string. Forces the slave into BOOT first.
    pub fn bootloader_version(&mut self, slave: u32) -> FieldbusResult<String, T::Error> {
        self.set_state(slave, EcState::Boot)?;
        self.file_command_text(slave, "bversion")
    }

    /// The bootloader's help text. Forces the slave into BOOT first.
    pub fn bootloader_help(&mut self, slave: u32) -> FieldbusResult<String, T::Error> {
        self.set_state(slave, EcState::Boot)?;
        self.file_command_text(slave, "help")
    }

    /// Flash a firmware image. Forces the slave into BOOT first.
    pub fn flash_firmware(&mut self, slave: u32, path: &Path) -> FieldbusResult<(), T::Error> {
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        info!("slave {slave}: flash {name:?}, {} bytes", data.len());
        self.set_state(slave, EcState::Boot)?;
        self.transport
            .file_write(slave, &name, &data)
            .map_err(FieldbusError::Transport)
    }

    /// Write the hardware description file and verify it landed.
    ///
    /// Compound operation over BOOT, unlock, write, read back and compare.
    /// Whichever sub-step fails is named in the error, and a failure never
    /// leaves a claim of partial success behind.
    pub fn write_hardware_description(
        &mut self,
        slave: u32,
        path: &Path,
        password: &str,
    ) -> FieldbusResult<(), T::Error> {
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        self.write_hardware_description_bytes(slave, &name, &data, password)
    }

    pub fn write_hardware_description_bytes(
        &mut self,
        slave: u32,
        name: &str,
        data: &[u8],
        password: &str,
    ) -> FieldbusResult<(), T::Error> {
        fn step<T, E>(result: FieldbusResult<T, E>, what: &str) -> FieldbusResult<T, E>
        where
            E: core::fmt::Debug + core::fmt::Display,
        {
            result.map_err(|e| {
                error!("{what}: {e}");
                FieldbusError::Step(format!("{what} failed"))
            })
        }

        info!("slave {slave}: write hardware description {name:?}");
        step(
            self.set_state(slave, EcState::Boot),
            "Set slave to state BOOT",
        )?;
        step(self.fs_unlock(slave, password), "Unlock filesystem")?;
        step(
            self.transport
                .file_write(slave, name, data)
                .map_err(FieldbusError::Transport),
            "Write hardware description",
        )?;
        let readback = step(
            self.transport
                .file_read(slave, name)
                .map_err(FieldbusError::Transport),
            "Read back hardware description",
        )?;
        if readback != data {
            error!(
                "hardware description mismatch, wrote {} bytes, read {} back",
                data.len(),
                readback.len()
            );
            return Err(FieldbusError::Step(
                "Verify hardware description failed".to_string(),
            ));
        }
        Ok(())
    }
}
