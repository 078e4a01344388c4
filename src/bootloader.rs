//! Driver for the UART bootloader shell of the servo drives.
//!
//! The bootloader presents a line-oriented console over the debug UART.
//! Commands go out character by character with a small pacing delay, answers
//! are drained until the line goes quiet. File content moves over the same
//! wire via [YMODEM](crate::ymodem).

use std::collections::BTreeMap;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use embedded_io::Error;
use log::{debug, info};

use crate::{
    error::{BootloaderError, BootloaderResult},
    listing,
    ymodem,
};

/// How long we wait for the first byte of a command response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Pacing delay between command characters. The bootloader loses characters
/// when they arrive back to back.
const CHAR_DELAY: Duration = Duration::from_millis(2);
/// Quiet time that ends the response drain.
const DRAIN_PAUSE: Duration = Duration::from_millis(50);
/// Total attempts for a command answered with "Unknown command".
const CMD_RETRIES: usize = 5;

/// Observed effective YMODEM throughput in bytes per second, used to size
/// transfer deadlines.
const TRANSFER_RATE: f64 = 8000.0;
/// File transfers never get less than this.
const MIN_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Content flashed in place of a firmware to blank the application slot.
/// Flashing it always "fails" from the bootloader's point of view, which is
/// exactly the point.
const PLACEHOLDER_NAME: &str = "empty_app.bin";
const PLACEHOLDER_CONTENT: &[u8] = b"This is not a firmware.\n";

/// Deadline for transferring `size` bytes, with a floor for small files.
pub fn transfer_timeout(size: u64) -> Duration {
    let seconds = (size as f64 / TRANSFER_RATE + 1.0).max(5.0);
    Duration::from_secs_f64(seconds)
}

/// Strip console decoration from a bootloader response.
pub fn clean(msg: &[u8]) -> String {
    let text = String::from_utf8_lossy(msg).to_string();
    text.replace("\r\n", "\n")
        .replace('>', "")
        .replace('\u{8}', "")
        .replace('\r', "\n")
        .trim()
        .to_string()
}

/// A session with the UART bootloader over any interface which implements
/// [embedded_io::Read] & [embedded_io::Write].
///
/// The device must already sit in BOOT mode; a drive that booted into its
/// firmware does not answer on this UART and every command runs into the
/// response timeout.
pub struct Bootloader<S: embedded_io::Read + embedded_io::Write> {
    interface: S,
    response_timeout: Duration,
}

impl<S: embedded_io::Read + embedded_io::Write> Bootloader<S> {
    pub fn new(interface: S) -> Self {
        Self {
            interface,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Override the deadline for the first response byte.
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// Write one command line and collect the raw response bytes.
    fn send_cmd_raw(&mut self, cmd: &str, timeout: Duration) -> BootloaderResult<Vec<u8>, S::Error> {
        for &byte in cmd.as_bytes() {
            self.interface
                .write_all(&[byte])
                .map_err(BootloaderError::Serial)?;
            thread::sleep(CHAR_DELAY);
        }
        self.interface
            .write_all(b"\r\n")
            .map_err(BootloaderError::Serial)?;

        let deadline = Instant::now() + timeout;
        let mut response: Vec<u8> = Vec::new();
        let mut temp_buf = [0u8; 256];
        // Wait for the first bytes of the answer.
        loop {
            match self.interface.read(&mut temp_buf) {
                Ok(0) => {}
                Ok(bytes_read) => {
                    response.extend_from_slice(&temp_buf[0..bytes_read]);
                    break;
                }
                Err(e) => match e.kind() {
                    embedded_io::ErrorKind::Other | embedded_io::ErrorKind::TimedOut => {}
                    _ => return Err(BootloaderError::Serial(e)),
                },
            }
            if Instant::now() >= deadline {
                return Err(BootloaderError::Timeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
        // Drain until the line goes quiet.
        loop {
            thread::sleep(DRAIN_PAUSE);
            match self.interface.read(&mut temp_buf) {
                Ok(0) => break,
                Ok(bytes_read) => response.extend_from_slice(&temp_buf[0..bytes_read]),
                Err(e) => match e.kind() {
                    embedded_io::ErrorKind::Other | embedded_io::ErrorKind::TimedOut => break,
                    _ => return Err(BootloaderError::Serial(e)),
                },
            }
        }
        Ok(response)
    }

    /// Collect whatever the bootloader prints after a file transfer.
    ///
    /// The confirmation can lag the last transfer byte, so this waits up to
    /// the response timeout for it to start. Silence is not an error here,
    /// the callers decide what an empty answer means.
    fn drain(&mut self) -> BootloaderResult<Vec<u8>, S::Error> {
        let deadline = Instant::now() + self.response_timeout;
        let mut leftover: Vec<u8> = Vec::new();
        let mut temp_buf = [0u8; 256];
        loop {
            match self.interface.read(&mut temp_buf) {
                Ok(0) => {}
                Ok(bytes_read) => {
                    leftover.extend_from_slice(&temp_buf[0..bytes_read]);
                    break;
                }
                Err(e) => match e.kind() {
                    embedded_io::ErrorKind::Other | embedded_io::ErrorKind::TimedOut => {}
                    _ => return Err(BootloaderError::Serial(e)),
                },
            }
            if Instant::now() >= deadline {
                return Ok(leftover);
            }
            thread::sleep(Duration::from_millis(1));
        }
        // Drain until the line goes quiet.
        loop {
            thread::sleep(DRAIN_PAUSE);
            match self.interface.read(&mut temp_buf) {
                Ok(0) => break,
                Ok(bytes_read) => leftover.extend_from_slice(&temp_buf[0..bytes_read]),
                Err(e) => match e.kind() {
                    embedded_io::ErrorKind::Other | embedded_io::ErrorKind::TimedOut => break,
                    _ => return Err(BootloaderError::Serial(e)),
                },
            }
        }
        Ok(leftover)
    }

    /// Send a command and return the cleaned response.
    ///
    /// A garbled command line makes the bootloader answer "Unknown command",
    /// in which case the command is sent again. Exhausting the retry budget
    /// is an error.
    pub fn send_cmd(&mut self, cmd: &str) -> BootloaderResult<String, S::Error> {
        for attempt in 1..=CMD_RETRIES {
            let response = self.send_cmd_raw(cmd, self.response_timeout)?;
            if !contains_subslice(&response, b"Unknown command") {
                return Ok(clean(&response));
            }
            debug!("bootloader did not recognise {cmd:?}, attempt {attempt}/{CMD_RETRIES}");
        }
        Err(BootloaderError::UnknownCommand(cmd.to_string()))
    }

    /// Leave the bootloader and start the firmware.
    pub fn boot(&mut self) -> BootloaderResult<String, S::Error> {
        self.send_cmd("boot")
    }

    /// Stay in the bootloader instead of booting the firmware.
    pub fn hold(&mut self) -> BootloaderResult<String, S::Error> {
        self.send_cmd("hold")
    }

    /// Run the bootloader's flash storage check.
    pub fn check(&mut self) -> BootloaderResult<String, S::Error> {
        self.send_cmd("check")
    }

    /// Bootloader version string.
    pub fn version(&mut self) -> BootloaderResult<String, S::Error> {
        self.send_cmd("version")
    }

    /// The bootloader's own help text.
    pub fn help_text(&mut self) -> BootloaderResult<String, S::Error> {
        self.send_cmd("help")
    }

    /// List the files on the device, name to size in bytes.
    pub fn ls(&mut self) -> BootloaderResult<BTreeMap<String, u32>, S::Error> {
        let text = self.send_cmd("ls")?;
        Ok(listing::parse_file_list(&text))
    }

    /// Unlock the protected part of the flash filesystem.
    pub fn unlock(&mut self, password: &str) -> BootloaderResult<String, S::Error> {
        self.send_cmd(&format!("fs-stackunlock={password}"))
    }

    /// Delete a file from the device.
    pub fn rm(&mut self, name: &str) -> BootloaderResult<(), S::Error> {
        info!("remove {name:?}");
        let response = self.send_cmd(&format!("rm {name}"))?;
        if response.is_empty() {
            return Err(BootloaderError::CommandFailed(format!("rm {name}")));
        }
        Ok(())
    }

    /// Run a transfer command and ship the file. Returns whatever the
    /// bootloader printed after the transfer.
    fn file_write_inner(
        &mut self,
        cmd: &str,
        name: &str,
        data: &[u8],
    ) -> BootloaderResult<Vec<u8>, S::Error> {
        let timeout = transfer_timeout(data.len() as u64);

        // An empty line first, to make sure someone is listening before we
        // start a transfer that is expensive to abort.
        self.send_cmd_raw("\n", self.response_timeout)?;
        let response = self.send_cmd_raw(cmd, self.response_timeout)?;
        debug!("{}", clean(&response));

        ymodem::send(&mut self.interface, name, data, timeout)?;
        thread::sleep(Duration::from_millis(10));
        self.drain()
    }

    /// Write a local file to the device's flash storage.
    pub fn write_file(&mut self, path: &Path) -> BootloaderResult<bool, S::Error> {
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        self.write_file_bytes(&name, &data)
    }

    /// Write a file given as bytes to the device's flash storage.
    pub fn write_file_bytes(&mut self, name: &str, data: &[u8]) -> BootloaderResult<bool, S::Error> {
        info!("write {name:?}, {} bytes", data.len());
        let response = self.file_write_inner("write", name, data)?;
        if response.is_empty() {
            return Err(BootloaderError::CommandFailed(format!("write {name}")));
        }
        Ok(true)
    }

    /// Read a file from the device's flash storage.
    pub fn read_file(&mut self, name: &str) -> BootloaderResult<Vec<u8>, S::Error> {
        info!("read {name:?}");
        let size = *self
            .ls()?
            .get(name)
            .ok_or_else(|| BootloaderError::FileMissing(name.to_string()))?;
        let timeout = transfer_timeout(size as u64);

        self.send_cmd_raw("\n", self.response_timeout)?;
        let response = self.send_cmd_raw(&format!("read {name}"), self.response_timeout)?;
        debug!("{}", clean(&response));

        let (_, content) = ymodem::recv(&mut self.interface, timeout)?;
        thread::sleep(Duration::from_millis(10));
        self.drain()?;

        if content.is_empty() {
            return Err(BootloaderError::EmptyFile(name.to_string()));
        }
        Ok(content)
    }

    /// Flash a firmware image into the application slot.
    pub fn flash_firmware(&mut self, path: &Path) -> BootloaderResult<String, S::Error> {
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        info!("flash {name:?}, {} bytes", data.len());
        let response = self.file_write_inner("flash", &name, &data)?;
        Ok(clean(&response))
    }

    /// Blank the application slot by flashing a placeholder that never
    /// passes the bootloader's firmware check.
    pub fn flash_empty_placeholder(&mut self) -> BootloaderResult<String, S::Error> {
        // The bootloader reports a failure for the placeholder, so the
        // response is ignored.
        self.file_write_inner("flash", PLACEHOLDER_NAME, PLACEHOLDER_CONTENT)?;
        Ok("Successfully removed".to_string())
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::MockSerial;
    use crate::ymodem::{ACK, CAN, CRC_REQUEST, EOT, LONG_BLOCK_LEN, NAK, PAD_BYTE, SHORT_BLOCK_LEN, SOH, STX, crc16};

    const SHORT_TIMEOUT: Duration = Duration::from_millis(20);

    fn test_bootloader() -> Bootloader<MockSerial> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut bootloader = Bootloader::new(MockSerial::new());
        bootloader.set_response_timeout(SHORT_TIMEOUT);
        bootloader
    }

    #[test]
    fn transfer_timeout_scales_with_file_size() {
        assert_eq!(transfer_timeout(1_000_000), Duration::from_secs_f64(126.0));
    }

    #[test]
    fn transfer_timeout_has_a_floor() {
        assert_eq!(transfer_timeout(0), Duration::from_secs_f64(5.0));
        assert_eq!(transfer_timeout(8 * 1024), Duration::from_secs_f64(5.0));
    }

    #[test]
    fn clean_strips_console_decoration() {
        let raw = b"> v1.2\x08\r\nready\r> ";
        assert_eq!(clean(raw), "v1.2\nready");

        assert_eq!(clean(b">>> \r\n"), "");
    }

    #[test]
    fn send_cmd_recovers_from_unknown_command() {
        let mut bootloader = test_bootloader();
        for _ in 0..4 {
            bootloader.interface.push_response(b"Unknown command\r\n> ");
        }
        bootloader.interface.push_response(b"v1.0\r\n> ");

        let response = bootloader.send_cmd("version").unwrap();
        assert_eq!(response, "v1.0");

        // The command went out five times, character by character.
        let written = bootloader.interface.written_data();
        let sent_commands = written
            .windows(b"version\r\n".len())
            .filter(|window| *window == b"version\r\n")
            .count();
        assert_eq!(sent_commands, 5);
    }

    #[test]
    fn send_cmd_gives_up_after_the_retry_budget() {
        let mut bootloader = test_bootloader();
        for _ in 0..CMD_RETRIES {
            bootloader.interface.push_response(b"Unknown command\r\n> ");
        }

        let result = bootloader.send_cmd("version");
        assert!(matches!(result, Err(BootloaderError::UnknownCommand(_))));
    }

    #[test]
    fn silence_means_not_in_boot_mode() {
        let mut bootloader = test_bootloader();
        let result = bootloader.ls();
        assert!(matches!(result, Err(BootloaderError::Timeout)));
    }

    #[test]
    fn ls_parses_the_file_listing() {
        let mut bootloader = test_bootloader();
        bootloader
            .interface
            .push_response(b"app.bin 81234\r\nconfig.csv 512\r\n> ");

        let files = bootloader.ls().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files["app.bin"], 81234);
        assert_eq!(files["config.csv"], 512);
    }

    #[test]
    fn rm_requires_a_confirmation() {
        let mut bootloader = test_bootloader();
        bootloader.interface.push_response(b"removed\r\n> ");
        bootloader.rm("app.bin").unwrap();

        // A bare prompt cleans down to nothing and is treated as a failure.
        bootloader.interface.push_response(b"> ");
        let result = bootloader.rm("app.bin");
        assert!(matches!(result, Err(BootloaderError::CommandFailed(_))));
    }

    #[test]
    fn write_file_runs_the_full_transfer() {
        let mut bootloader = test_bootloader();
        bootloader.interface.push_response(b"> "); // empty line probe
        bootloader.interface.push_response(b"Ready to receive\r\n"); // write command
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[ACK]); // header
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[ACK]); // data block
        bootloader.interface.push_response(&[NAK]); // first EOT
        bootloader.interface.push_response(&[ACK]); // second EOT
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[ACK]); // null header
        bootloader.interface.push_response(b"File written\r\n> ");

        let result = bootloader.write_file_bytes("config.csv", b"a,b,c\n").unwrap();
        assert!(result);

        let written = bootloader.interface.written_data();
        assert!(contains_subslice(written, b"write\r\n"));
        assert!(written.contains(&STX));
    }

    #[test]
    fn write_confirmation_survives_a_quiet_gap() {
        let mut bootloader = test_bootloader();
        bootloader.interface.push_response(b"> ");
        bootloader.interface.push_response(b"Ready to receive\r\n");
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[ACK]);
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[ACK]);
        bootloader.interface.push_response(&[NAK]);
        bootloader.interface.push_response(&[ACK]);
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[ACK]);
        // The confirmation starts only after the line was quiet for a
        // moment.
        bootloader.interface.push_response(b"");
        bootloader.interface.push_response(b"");
        bootloader.interface.push_response(b"File written\r\n> ");

        let result = bootloader.write_file_bytes("config.csv", b"a,b,c\n").unwrap();
        assert!(result);
    }

    #[test]
    fn write_file_without_a_confirmation_fails() {
        let mut bootloader = test_bootloader();
        bootloader.interface.push_response(b"> ");
        bootloader.interface.push_response(b"Ready to receive\r\n");
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[ACK]);
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[ACK]);
        bootloader.interface.push_response(&[NAK]);
        bootloader.interface.push_response(&[ACK]);
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[ACK]);
        // Nothing after the transfer.

        let result = bootloader.write_file_bytes("config.csv", b"a,b,c\n");
        assert!(matches!(result, Err(BootloaderError::CommandFailed(_))));
    }

    fn make_block(block_num: u8, payload: &[u8]) -> Vec<u8> {
        let marker = if payload.len() == LONG_BLOCK_LEN { STX } else { SOH };
        let mut block = vec![marker, block_num, !block_num];
        block.extend_from_slice(payload);
        block.extend_from_slice(&crc16(payload).to_be_bytes());
        block
    }

    #[test]
    fn read_file_looks_up_the_size_first() {
        let mut bootloader = test_bootloader();
        bootloader.interface.push_response(b"fw.bin 5\r\n> "); // ls
        bootloader.interface.push_response(b"> "); // empty line probe
        bootloader.interface.push_response(b"Sending\r\n"); // read command

        let mut header = [0u8; SHORT_BLOCK_LEN];
        header[..6].copy_from_slice(b"fw.bin");
        header[7] = b'5';
        bootloader.interface.push_response(&make_block(0, &header));
        let mut data = [PAD_BYTE; LONG_BLOCK_LEN];
        data[..5].copy_from_slice(b"hello");
        bootloader.interface.push_response(&make_block(1, &data));
        bootloader.interface.push_response(&[EOT]);
        bootloader.interface.push_response(&[EOT]);
        bootloader.interface.push_response(&make_block(0, &[0u8; SHORT_BLOCK_LEN]));

        let content = bootloader.read_file("fw.bin").unwrap();
        assert_eq!(content, b"hello");
    }

    #[test]
    fn read_file_rejects_names_not_on_the_device() {
        let mut bootloader = test_bootloader();
        bootloader.interface.push_response(b"other.bin 10\r\n> ");

        let result = bootloader.read_file("fw.bin");
        assert!(matches!(result, Err(BootloaderError::FileMissing(_))));
        // No transfer was started.
        let written = bootloader.interface.written_data();
        assert!(!written.contains(&CRC_REQUEST));
    }

    #[test]
    fn transfer_errors_bubble_up() {
        let mut bootloader = test_bootloader();
        bootloader.interface.push_response(b"> ");
        bootloader.interface.push_response(b"Ready\r\n");
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[CAN, CAN]);

        let result = bootloader.write_file_bytes("x", b"y");
        assert!(matches!(result, Err(BootloaderError::Transfer(_))));
    }

    #[test]
    fn flash_empty_placeholder_reports_success_regardless() {
        let mut bootloader = test_bootloader();
        bootloader.interface.push_response(b"> ");
        bootloader.interface.push_response(b"Ready\r\n");
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[ACK]);
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[ACK]);
        bootloader.interface.push_response(&[NAK]);
        bootloader.interface.push_response(&[ACK]);
        bootloader.interface.push_response(&[CRC_REQUEST]);
        bootloader.interface.push_response(&[ACK]);
        // The bootloader stays silent after a rejected placeholder flash.

        let response = bootloader.flash_empty_placeholder().unwrap();
        assert_eq!(response, "Successfully removed");
    }
}
