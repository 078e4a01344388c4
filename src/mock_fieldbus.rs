//! We use this mocking module in unit tests to emulate a fieldbus slave.
//!
//! The mock is dumb storage: registers, object dictionary and files are
//! plain maps that tests seed and inspect. Canned answers for the file
//! surface commands go into `files` under the command name.

use std::collections::BTreeMap;

use crate::ectypes::EcState;
use crate::fieldbus::RegisterTransport;

#[derive(Debug)]
pub struct MockError(pub String);

impl core::fmt::Display for MockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct MockFieldbus {
    /// Slave controller register space, keyed by (slave, address)
    pub registers: BTreeMap<(u32, u16), Vec<u8>>,
    /// Object dictionary, keyed by (slave, index, subindex)
    pub sdo: BTreeMap<(u32, u16, u8), Vec<u8>>,
    /// File storage and canned file-surface answers, keyed by name
    pub files: BTreeMap<String, Vec<u8>>,
    /// Names shipped through file_write, in order
    pub file_writes: Vec<String>,
    /// Raw AL status byte
    pub state: u8,
    /// Every state the master asked for, in order
    pub requested_states: Vec<EcState>,
    /// States the slave refuses to enter
    pub refuse_states: Vec<EcState>,
    /// Remaining SDO accesses that fail before one succeeds
    pub sdo_failures: usize,
    /// Process data the slave answers with
    pub pdo_input: Vec<u8>,
    /// Last process data received from the master
    pub pdo_output: Vec<u8>,
    /// Flip a bit in every stored file to break read-back verification
    pub corrupt_file_writes: bool,
}

impl MockFieldbus {
    pub fn new() -> Self {
        Self {
            registers: BTreeMap::new(),
            sdo: BTreeMap::new(),
            files: BTreeMap::new(),
            file_writes: Vec::new(),
            state: EcState::Init.code(),
            requested_states: Vec::new(),
            refuse_states: Vec::new(),
            sdo_failures: 0,
            pdo_input: Vec::new(),
            pdo_output: Vec::new(),
            corrupt_file_writes: false,
        }
    }

    fn sdo_gate(&mut self) -> Result<(), MockError> {
        if self.sdo_failures > 0 {
            self.sdo_failures -= 1;
            return Err(MockError("SDO refused".to_string()));
        }
        Ok(())
    }
}

impl RegisterTransport for MockFieldbus {
    type Error = MockError;

    fn reg_read(&mut self, slave: u32, address: u16, len: usize) -> Result<Vec<u8>, Self::Error> {
        let mut data = self
            .registers
            .get(&(slave, address))
            .cloned()
            .unwrap_or_default();
        data.resize(len, 0);
        Ok(data)
    }

    fn reg_write(&mut self, slave: u32, address: u16, data: &[u8]) -> Result<(), Self::Error> {
        self.registers.insert((slave, address), data.to_vec());
        Ok(())
    }

    fn sdo_upload(&mut self, slave: u32, index: u16, subindex: u8) -> Result<Vec<u8>, Self::Error> {
        self.sdo_gate()?;
        self.sdo
            .get(&(slave, index, subindex))
            .cloned()
            .ok_or_else(|| MockError(format!("no object {index:#06X}:{subindex}")))
    }

    fn sdo_download(
        &mut self,
        slave: u32,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), Self::Error> {
        self.sdo_gate()?;
        self.sdo.insert((slave, index, subindex), data.to_vec());
        Ok(())
    }

    fn file_read(&mut self, _slave: u32, name: &str) -> Result<Vec<u8>, Self::Error> {
        Ok(self.files.get(name).cloned().unwrap_or_default())
    }

    fn file_write(&mut self, _slave: u32, name: &str, data: &[u8]) -> Result<(), Self::Error> {
        self.file_writes.push(name.to_string());
        // fs-* commands are actions, not files.
        if !name.starts_with("fs-") {
            let mut stored = data.to_vec();
            if self.corrupt_file_writes {
                if let Some(byte) = stored.first_mut() {
                    *byte ^= 0x01;
                }
            }
            self.files.insert(name.to_string(), stored);
        }
        Ok(())
    }

    fn state(&mut self, _slave: u32) -> Result<u8, Self::Error> {
        Ok(self.state)
    }

    fn request_state(&mut self, _slave: u32, state: EcState) -> Result<(), Self::Error> {
        self.requested_states.push(state);
        if !self.refuse_states.contains(&state) {
            self.state = state.code();
        }
        Ok(())
    }

    fn pdo_exchange(&mut self, _slave: u32, outputs: &[u8]) -> Result<Vec<u8>, Self::Error> {
        self.pdo_output = outputs.to_vec();
        Ok(self.pdo_input.clone())
    }
}
