//! We use this mocking module in unit tests to emulate a serial port.
//!
//! Responses are queued as whole chunks. Reads serve bytes from the chunk at
//! the front of the queue and answer `WouldBlock` once it runs dry, so the
//! drain loops in the engines terminate the same way they do against a real
//! port with a receive timeout.

use std::collections::VecDeque;

/// Our mock type used to emulate a serial port.
pub struct MockSerial {
    /// Buffer to store data written to the mock serial port
    write_buffer: heapless::Vec<u8, 8192>,
    /// Pre-configured response chunks, served in order
    responses: VecDeque<Vec<u8>>,
    /// Chunk currently being read, with the read position
    current: Option<(Vec<u8>, usize)>,
    /// Flag to simulate write errors
    should_error_on_write: bool,
    /// Flag to simulate read errors
    should_error_on_read: bool,
}

#[derive(Debug)]
pub enum MockSerialError {
    /// Simulated timeout error
    Timeout,
    /// Simulated buffer overflow
    BufferOverflow,
    /// Generic simulated error for testing
    SimulatedError,
    /// Would block - no data available
    WouldBlock,
}

impl core::fmt::Display for MockSerialError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            MockSerialError::Timeout => "simulated timeout",
            MockSerialError::BufferOverflow => "mock write buffer is full",
            MockSerialError::SimulatedError => "simulated I/O error",
            MockSerialError::WouldBlock => "no data queued",
        };
        write!(f, "{text}")
    }
}

impl core::error::Error for MockSerialError {}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::Timeout => embedded_io::ErrorKind::TimedOut,
            MockSerialError::BufferOverflow => embedded_io::ErrorKind::OutOfMemory,
            MockSerialError::SimulatedError => embedded_io::ErrorKind::BrokenPipe,
            MockSerialError::WouldBlock => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }

        if self
            .write_buffer
            .extend_from_slice(buf)
            .is_err()
        {
            return Err(MockSerialError::BufferOverflow);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_read {
            return Err(MockSerialError::SimulatedError);
        }

        if self.current.is_none() {
            match self.responses.pop_front() {
                Some(chunk) => self.current = Some((chunk, 0)),
                None => return Err(MockSerialError::WouldBlock),
            }
        }

        let (chunk, position) = self.current.as_mut().expect("set above");
        if *position >= chunk.len() {
            // Chunk exhausted, signal a quiet line once before moving on to
            // the next chunk.
            self.current = None;
            return Err(MockSerialError::WouldBlock);
        }

        let bytes_to_read = core::cmp::min(buf.len(), chunk.len() - *position);
        buf[..bytes_to_read].copy_from_slice(&chunk[*position..*position + bytes_to_read]);
        *position += bytes_to_read;
        Ok(bytes_to_read)
    }
}

impl MockSerial {
    /// Create a new MockSerial instance with empty buffers
    pub fn new() -> Self {
        Self {
            write_buffer: heapless::Vec::new(),
            responses: VecDeque::new(),
            current: None,
            should_error_on_write: false,
            should_error_on_read: false,
        }
    }

    /// Queue a response chunk to be served by later read() calls
    pub fn push_response(&mut self, data: &[u8]) {
        self.responses.push_back(data.to_vec());
    }

    /// Get a reference to the data that was written to this mock serial port
    pub fn written_data(&self) -> &[u8] {
        &self.write_buffer
    }

    /// Clear the write buffer
    pub fn clear_written_data(&mut self) {
        self.write_buffer.clear();
    }

    /// Configure whether write operations should fail with an error
    pub fn set_write_error(&mut self, should_error: bool) {
        self.should_error_on_write = should_error;
    }

    /// Configure whether read operations should fail with an error
    pub fn set_read_error(&mut self, should_error: bool) {
        self.should_error_on_read = should_error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error, Read, Write};

    #[test]
    fn test_new_mock_serial() {
        let mock = MockSerial::new();
        assert_eq!(mock.written_data().len(), 0);
        assert!(mock.responses.is_empty());
        assert_eq!(mock.should_error_on_write, false);
        assert_eq!(mock.should_error_on_read, false);
    }

    #[test]
    fn test_write_data() {
        let mut mock = MockSerial::new();
        let test_data = b"Hello, World!";

        let result = mock.write(test_data);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), test_data.len());
        assert_eq!(mock.written_data(), test_data);
    }

    #[test]
    fn test_write_multiple_times() {
        let mut mock = MockSerial::new();
        mock.write(b"Hello, ").unwrap();
        mock.write(b"World!").unwrap();

        assert_eq!(mock.written_data(), b"Hello, World!");
    }

    #[test]
    fn test_write_buffer_overflow() {
        let mut mock = MockSerial::new();
        let large_data = vec![0u8; 9000]; // Larger than the buffer capacity

        let result = mock.write(&large_data);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), MockSerialError::BufferOverflow));
    }

    #[test]
    fn test_read_single_chunk() {
        let mut mock = MockSerial::new();
        mock.push_response(b"Response data");

        let mut buffer = [0u8; 20];
        let result = mock.read(&mut buffer);

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 13);
        assert_eq!(&buffer[..13], b"Response data");
    }

    #[test]
    fn test_read_partial_data() {
        let mut mock = MockSerial::new();
        mock.push_response(b"Long response data");

        let mut buffer = [0u8; 5];
        let result = mock.read(&mut buffer);

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 5);
        assert_eq!(&buffer, b"Long ");
    }

    #[test]
    fn test_chunk_boundary_blocks_once() {
        let mut mock = MockSerial::new();
        mock.push_response(b"first");
        mock.push_response(b"second");

        let mut buffer = [0u8; 10];
        assert_eq!(mock.read(&mut buffer).unwrap(), 5);
        assert_eq!(&buffer[..5], b"first");

        // The quiet line between the two chunks.
        let blocked = mock.read(&mut buffer);
        assert!(matches!(blocked.unwrap_err(), MockSerialError::WouldBlock));

        assert_eq!(mock.read(&mut buffer).unwrap(), 6);
        assert_eq!(&buffer[..6], b"second");
    }

    #[test]
    fn test_read_blocks_when_no_data() {
        let mut mock = MockSerial::new();
        let mut buffer = [0u8; 10];

        let result = mock.read(&mut buffer);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), MockSerialError::WouldBlock));
    }

    #[test]
    fn test_write_error_simulation() {
        let mut mock = MockSerial::new();
        mock.set_write_error(true);

        let result = mock.write(b"test");
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), MockSerialError::SimulatedError));
        assert_eq!(mock.written_data().len(), 0); // Nothing should be written
    }

    #[test]
    fn test_read_error_simulation() {
        let mut mock = MockSerial::new();
        mock.push_response(b"test data");
        mock.set_read_error(true);

        let mut buffer = [0u8; 10];
        let result = mock.read(&mut buffer);

        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), MockSerialError::SimulatedError));
    }

    #[test]
    fn test_error_kinds() {
        assert!(matches!(
            MockSerialError::Timeout.kind(),
            embedded_io::ErrorKind::TimedOut
        ));
        assert!(matches!(
            MockSerialError::BufferOverflow.kind(),
            embedded_io::ErrorKind::OutOfMemory
        ));
        assert!(matches!(
            MockSerialError::WouldBlock.kind(),
            embedded_io::ErrorKind::Other
        ));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(MockSerialError::Timeout.to_string(), "simulated timeout");
        assert_eq!(MockSerialError::WouldBlock.to_string(), "no data queued");
    }

    #[test]
    fn test_clear_written_data() {
        let mut mock = MockSerial::new();
        mock.write(b"test data").unwrap();
        assert!(!mock.written_data().is_empty());

        mock.clear_written_data();
        assert!(mock.written_data().is_empty());
    }
}
