//! Session layer for EA PS 2000 series bench supplies.

use std::thread;
use std::time::{Duration, Instant};

use embedded_io::Error;
use log::{debug, info, warn};

use crate::{
    error::{PsuError, PsuResult},
    objects::{self, ObjectEntry, control_bits},
    telegram::{self, Ack, ControllerMode, DeviceErrorCode},
};

/// First (or only) output of the supply.
pub const OUTPUT_1: u8 = 0;
/// Second output of triple output models.
pub const OUTPUT_2: u8 = 1;

/// How long we wait for the first response byte before giving up.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause between writing a telegram and polling for the answer.
const POST_WRITE_DELAY: Duration = Duration::from_millis(5);
/// Pause after a completed round trip. The supply needs this gap before the
/// next telegram.
const INTER_TELEGRAM_DELAY: Duration = Duration::from_millis(40);
/// How often a control telegram is re-sent when the acknowledge is garbled.
const ACK_RETRIES: usize = 5;

/// Identity block read from the device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceDescription {
    pub name: String,
    pub serial_number: String,
    pub article_number: String,
    pub manufacturer: String,
    pub software_version: String,
    /// 1 for single output models, 2 for triple output models. The third
    /// output of a triple is fixed and not addressable.
    pub controllable_outputs: u8,
}

/// Last known state of one output.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutputState {
    pub remote_on: bool,
    pub output_on: bool,
    pub mode: ControllerMode,
    pub tracking_active: bool,
    pub ovp_active: bool,
    pub ocp_active: bool,
    pub opp_active: bool,
    pub otp_active: bool,
    /// Measured output voltage in volts.
    pub act_voltage: f32,
    /// Measured output current in amps.
    pub act_current: f32,
}

/// Cached nominal limits and the current power budget inputs.
#[derive(Debug, Clone, Copy, Default)]
struct Quantities {
    nom_voltage: f32,
    nom_current: f32,
    nom_power: f32,
    /// Last voltage setpoint, used to bound the current setpoint.
    act_voltage: f32,
    /// Last current setpoint, used to bound the voltage setpoint.
    max_current: f32,
}

/// Which cached flag a control telegram updates on success.
#[derive(Debug, Clone, Copy)]
enum ControlFlag {
    RemoteOn,
    OutputOn,
}

/// A session with an EA PS 2000 supply over any interface which implements
/// [embedded_io::Read] & [embedded_io::Write].
///
/// The wire protocol is strictly half duplex, so all methods take `&mut self`
/// and a session must not be shared between threads. Methods that touch an
/// object automatically switch the output into remote mode first and load the
/// nominal values on that occasion.
pub struct EaPsu<S: embedded_io::Read + embedded_io::Write> {
    interface: S,
    response_timeout: Duration,
    description: Option<DeviceDescription>,
    controllable_outputs: u8,
    outputs: [OutputState; 2],
    quantities: Quantities,
}

impl<S: embedded_io::Read + embedded_io::Write> EaPsu<S> {
    /// Create a new session over the given interface.
    ///
    /// Nothing is sent until the first method call.
    pub fn new(interface: S) -> Self {
        Self {
            interface,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            description: None,
            controllable_outputs: 1,
            outputs: [OutputState::default(); 2],
            quantities: Quantities::default(),
        }
    }

    /// Override the deadline for the first response byte.
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// Write a telegram and collect the response telegram.
    ///
    /// Waits up to the response timeout for the first byte, then drains the
    /// interface until it runs dry. Returns the payload with header and
    /// checksum stripped.
    fn transfer(&mut self, frame: &[u8], expect_len: usize) -> PsuResult<Vec<u8>, S::Error> {
        self.interface
            .write_all(frame)
            .map_err(PsuError::Serial)?;
        thread::sleep(POST_WRITE_DELAY);

        let deadline = Instant::now() + self.response_timeout;
        let mut response: Vec<u8> = Vec::new();
        let mut temp_buf = [0u8; 64];
        loop {
            match self.interface.read(&mut temp_buf) {
                Ok(0) => {
                    if !response.is_empty() {
                        break;
                    }
                    if Instant::now() >= deadline {
                        return Err(PsuError::Timeout);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(bytes_read) => {
                    response.extend_from_slice(&temp_buf[0..bytes_read]);
                }
                Err(e) => match e.kind() {
                    // WouldBlock style conditions. Once we have data this
                    // means the device finished talking.
                    embedded_io::ErrorKind::Other | embedded_io::ErrorKind::TimedOut => {
                        if !response.is_empty() {
                            break;
                        }
                        if Instant::now() >= deadline {
                            return Err(PsuError::Timeout);
                        }
                        thread::sleep(Duration::from_millis(1));
                    }
                    _ => return Err(PsuError::Serial(e)),
                },
            }
        }
        thread::sleep(INTER_TELEGRAM_DELAY);

        if response.len() < 6 {
            return Err(PsuError::Malformed(response));
        }
        // A truncated answer with a nonzero trailing byte is the device
        // substituting an error code for the requested object.
        let trailing = response[response.len() - 3];
        if trailing != 0 && response.len() < expect_len + 5 {
            return match DeviceErrorCode::from_raw(trailing) {
                Some(code) => Err(PsuError::Device(code)),
                None => Err(PsuError::Malformed(response)),
            };
        }
        match telegram::strip(&response) {
            Some(payload) => Ok(payload.to_vec()),
            None => Err(PsuError::Malformed(response)),
        }
    }

    /// Reject output numbers the device does not have, and output 2 while
    /// tracking ties it to output 1.
    fn check_output(&self, output: u8) -> PsuResult<(), S::Error> {
        if output > OUTPUT_1 && output >= self.controllable_outputs {
            return Err(PsuError::InvalidOutput {
                requested: output,
                available: self.controllable_outputs,
            });
        }
        if output > OUTPUT_1 && self.outputs[output as usize].tracking_active {
            return Err(PsuError::TrackingActive);
        }
        Ok(())
    }

    /// Object access requires remote mode, switch it on if we have not yet.
    fn ensure_remote(&mut self, output: u8) -> PsuResult<(), S::Error> {
        if !self.outputs[output as usize].remote_on {
            self.remote_on(output, true)?;
        }
        Ok(())
    }

    /// Read an object's payload.
    fn get_object(&mut self, object: &ObjectEntry, output: u8) -> PsuResult<Vec<u8>, S::Error> {
        self.check_output(output)?;
        self.ensure_remote(output)?;
        let frame = telegram::query(object, output);
        self.transfer(&frame, object.len as usize)
    }

    /// Write a scaled value to an object and check the acknowledge.
    fn set_object(
        &mut self,
        value: f32,
        nominal: f32,
        object: &ObjectEntry,
        output: u8,
    ) -> PsuResult<(), S::Error> {
        self.check_output(output)?;
        self.ensure_remote(output)?;
        if nominal == 0.0 {
            return Err(PsuError::ZeroNominal);
        }
        let raw = telegram::to_raw(value, nominal);
        let len = object.len as usize;
        let mut payload = [0u8; 4];
        for (i, byte) in payload[..len].iter_mut().enumerate() {
            *byte = (raw >> (8 * (len - 1 - i))) as u8;
        }
        let frame = telegram::set(object, output, &payload[..len]);
        let response = self.transfer(&frame, 1)?;
        match telegram::decode_ack(&response) {
            Ack::Accepted => Ok(()),
            Ack::Rejected(code) => Err(PsuError::Device(code)),
            Ack::Malformed(bytes) => Err(PsuError::Malformed(bytes)),
        }
    }

    /// Read a big-endian float object. The nominal value objects do not get a
    /// length hint in the start delimiter.
    fn get_float(&mut self, object: &ObjectEntry, output: u8) -> PsuResult<f32, S::Error> {
        let frame = telegram::query_bare(object, output);
        let payload = self.transfer(&frame, object.len as usize)?;
        if payload.len() < 4 {
            return Err(PsuError::Malformed(payload));
        }
        Ok(f32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))
    }

    /// Read a NUL padded string object. Strings are a device property and
    /// always read from output 1.
    fn get_string(&mut self, object: &ObjectEntry) -> PsuResult<String, S::Error> {
        let payload = self.get_object(object, OUTPUT_1)?;
        let text_len = payload
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(payload.len());
        Ok(String::from_utf8_lossy(&payload[..text_len])
            .trim()
            .to_string())
    }

    /// Send a control telegram and retry when the acknowledge is garbled.
    fn send_control(
        &mut self,
        output: u8,
        mask: u8,
        command: u8,
        update: Option<ControlFlag>,
    ) -> PsuResult<(), S::Error> {
        let frame = telegram::control(output, mask, command);
        for attempt in 1..=ACK_RETRIES {
            let response = self.transfer(&frame, 1)?;
            if response.len() == 1 {
                return match telegram::decode_ack(&response) {
                    Ack::Accepted => {
                        if let Some(flag) = update {
                            let state = &mut self.outputs[output as usize];
                            match flag {
                                ControlFlag::RemoteOn => state.remote_on = command != 0,
                                ControlFlag::OutputOn => state.output_on = command != 0,
                            }
                        }
                        Ok(())
                    }
                    Ack::Rejected(code) => Err(PsuError::Device(code)),
                    Ack::Malformed(bytes) => Err(PsuError::Malformed(bytes)),
                };
            }
            warn!(
                "garbled acknowledge ({} bytes), attempt {attempt}/{ACK_RETRIES}",
                response.len()
            );
        }
        Err(PsuError::NoAck(ACK_RETRIES))
    }

    /// Switch an output into remote mode.
    ///
    /// With `init` set, the nominal values are read afterwards and OVP/OCP
    /// are parked at the nominal maxima.
    pub fn remote_on(&mut self, output: u8, init: bool) -> PsuResult<(), S::Error> {
        self.check_output(output)?;
        self.send_control(
            output,
            control_bits::REMOTE_MASK,
            control_bits::REMOTE_ON,
            Some(ControlFlag::RemoteOn),
        )?;
        if init {
            let (nom_voltage, nom_current, _) = self.get_nominal_values(output, true)?;
            self.set_ovp(nom_voltage, output)?;
            self.set_ocp(nom_current, output)?;
        }
        Ok(())
    }

    /// Hand an output back to the front panel. No-op when already local.
    pub fn remote_off(&mut self, output: u8) -> PsuResult<(), S::Error> {
        self.check_output(output)?;
        if !self.outputs[output as usize].remote_on {
            return Ok(());
        }
        self.send_control(
            output,
            control_bits::REMOTE_MASK,
            control_bits::REMOTE_OFF,
            Some(ControlFlag::RemoteOn),
        )
    }

    /// Read the identity block. Cached after the first call unless `refresh`
    /// is set.
    pub fn get_device_description(
        &mut self,
        refresh: bool,
    ) -> PsuResult<DeviceDescription, S::Error> {
        if let Some(description) = &self.description {
            if !refresh {
                return Ok(description.clone());
            }
        }
        let name = self.get_string(&objects::DEVICE_TYPE)?;
        let serial_number = self.get_string(&objects::SERIAL_NUMBER)?;
        let article_number = self.get_string(&objects::ARTICLE_NUMBER)?;
        let manufacturer = self.get_string(&objects::MANUFACTURER)?;
        let software_version = self.get_string(&objects::SOFTWARE_VERSION)?;
        let class = self.get_object(&objects::DEVICE_CLASS, OUTPUT_1)?;
        let controllable_outputs = match class.get(1) {
            Some(&objects::DEVICE_CLASS_SINGLE) => 1,
            _ => 2,
        };
        self.controllable_outputs = controllable_outputs;
        let description = DeviceDescription {
            name,
            serial_number,
            article_number,
            manufacturer,
            software_version,
            controllable_outputs,
        };
        debug!("connected to {} ({})", description.name, description.serial_number);
        self.description = Some(description.clone());
        Ok(description)
    }

    /// Nominal output voltage in volts.
    pub fn get_nominal_voltage(&mut self, output: u8, update: bool) -> PsuResult<f32, S::Error> {
        if self.quantities.nom_voltage == 0.0 || update {
            self.quantities.nom_voltage = self.get_float(&objects::NOMINAL_VOLTAGE, output)?;
        }
        Ok(self.quantities.nom_voltage)
    }

    /// Nominal output current in amps.
    pub fn get_nominal_current(&mut self, output: u8, update: bool) -> PsuResult<f32, S::Error> {
        if self.quantities.nom_current == 0.0 || update {
            self.quantities.nom_current = self.get_float(&objects::NOMINAL_CURRENT, output)?;
        }
        Ok(self.quantities.nom_current)
    }

    /// Nominal output power in watts.
    pub fn get_nominal_power(&mut self, output: u8, update: bool) -> PsuResult<f32, S::Error> {
        if self.quantities.nom_power == 0.0 || update {
            self.quantities.nom_power = self.get_float(&objects::NOMINAL_POWER, output)?;
        }
        Ok(self.quantities.nom_power)
    }

    /// Nominal voltage, current and power in one go.
    pub fn get_nominal_values(
        &mut self,
        output: u8,
        update: bool,
    ) -> PsuResult<(f32, f32, f32), S::Error> {
        let voltage = self.get_nominal_voltage(output, update)?;
        let current = self.get_nominal_current(output, update)?;
        let power = self.get_nominal_power(output, update)?;
        Ok((voltage, current, power))
    }

    /// Set the voltage setpoint in volts.
    ///
    /// The value is clamped to the nominal voltage and to the power budget
    /// given the current setpoint. Returns the value actually applied.
    pub fn set_voltage(&mut self, voltage: f32, output: u8) -> PsuResult<f32, S::Error> {
        self.check_output(output)?;
        self.ensure_remote(output)?;
        let quantities = self.quantities;
        let mut set_voltage = voltage;
        if set_voltage > quantities.nom_voltage {
            set_voltage = quantities.nom_voltage;
        }
        if quantities.max_current > 0.0
            && set_voltage > quantities.nom_power / quantities.max_current
        {
            set_voltage = quantities.nom_power / quantities.max_current;
            info!(
                "voltage clamped to {set_voltage} V to keep within the nominal power of {} W",
                quantities.nom_power
            );
        }
        self.quantities.act_voltage = set_voltage;
        self.set_object(set_voltage, quantities.nom_voltage, &objects::SET_VOLTAGE, output)?;
        Ok(set_voltage)
    }

    /// Set the current setpoint in amps.
    ///
    /// The value is clamped to the nominal current and to the power budget
    /// given the voltage setpoint. Returns the value actually applied.
    pub fn set_current(&mut self, current: f32, output: u8) -> PsuResult<f32, S::Error> {
        self.check_output(output)?;
        self.ensure_remote(output)?;
        let quantities = self.quantities;
        let mut set_current = current;
        if set_current > quantities.nom_current {
            set_current = quantities.nom_current;
        }
        if quantities.act_voltage > 0.0
            && set_current > quantities.nom_power / quantities.act_voltage
        {
            set_current = quantities.nom_power / quantities.act_voltage;
            info!(
                "current clamped to {set_current} A to keep within the nominal power of {} W",
                quantities.nom_power
            );
        }
        self.quantities.max_current = set_current;
        self.set_object(set_current, quantities.nom_current, &objects::SET_CURRENT, output)?;
        Ok(set_current)
    }

    /// Measured output voltage in volts.
    pub fn get_voltage(&mut self, output: u8) -> PsuResult<f32, S::Error> {
        self.check_output(output)?;
        if self.quantities.nom_voltage == 0.0 {
            self.get_nominal_voltage(output, false)?;
        }
        let status = self.get_status(true)?;
        Ok(status[output as usize].act_voltage)
    }

    /// Measured output current in amps.
    pub fn get_current(&mut self, output: u8) -> PsuResult<f32, S::Error> {
        self.check_output(output)?;
        if self.quantities.nom_current == 0.0 {
            self.get_nominal_current(output, false)?;
        }
        let status = self.get_status(true)?;
        Ok(status[output as usize].act_current)
    }

    /// Measured output power in watts, rounded to 3 decimals.
    pub fn get_power(&mut self, output: u8) -> PsuResult<f32, S::Error> {
        self.check_output(output)?;
        let status = self.get_status(true)?;
        let state = &status[output as usize];
        Ok((state.act_voltage * state.act_current * 1000.0).round() / 1000.0)
    }

    /// Set the overvoltage protection threshold in volts.
    pub fn set_ovp(&mut self, voltage: f32, output: u8) -> PsuResult<(), S::Error> {
        let nom_voltage = self.quantities.nom_voltage;
        self.set_object(voltage, nom_voltage, &objects::OVP_THRESHOLD, output)
    }

    /// Read the overvoltage protection threshold in volts.
    pub fn get_ovp(&mut self, output: u8) -> PsuResult<f32, S::Error> {
        let payload = self.get_object(&objects::OVP_THRESHOLD, output)?;
        if payload.len() < 2 {
            return Err(PsuError::Malformed(payload));
        }
        let raw = u16::from_be_bytes([payload[0], payload[1]]);
        Ok(telegram::from_raw(raw, self.quantities.nom_voltage))
    }

    /// Set the overcurrent protection threshold in amps.
    pub fn set_ocp(&mut self, current: f32, output: u8) -> PsuResult<(), S::Error> {
        let nom_current = self.quantities.nom_current;
        self.set_object(current, nom_current, &objects::OCP_THRESHOLD, output)
    }

    /// Read the overcurrent protection threshold in amps.
    pub fn get_ocp(&mut self, output: u8) -> PsuResult<f32, S::Error> {
        let payload = self.get_object(&objects::OCP_THRESHOLD, output)?;
        if payload.len() < 2 {
            return Err(PsuError::Malformed(payload));
        }
        let raw = u16::from_be_bytes([payload[0], payload[1]]);
        Ok(telegram::from_raw(raw, self.quantities.nom_current))
    }

    /// State of all controllable outputs.
    ///
    /// With `refresh` set, the status object is read from the device. While
    /// tracking is active output 2 follows output 1, so its status is a copy
    /// of output 1 without a second round trip.
    pub fn get_status(&mut self, refresh: bool) -> PsuResult<Vec<OutputState>, S::Error> {
        if refresh {
            let mut fresh = [OutputState::default(); 2];
            for output in 0..self.controllable_outputs {
                let state = if output == OUTPUT_2 && fresh[OUTPUT_1 as usize].tracking_active {
                    debug!("tracking active, output 2 mirrors output 1");
                    fresh[OUTPUT_1 as usize]
                } else {
                    let payload = self.get_object(&objects::STATUS_ACTUAL, output)?;
                    let raw = telegram::decode_status(&payload)
                        .ok_or_else(|| PsuError::Malformed(payload.clone()))?;
                    OutputState {
                        remote_on: raw.remote_on,
                        output_on: raw.bits.output_on(),
                        mode: ControllerMode::from(raw.bits),
                        tracking_active: raw.bits.tracking_active(),
                        ovp_active: raw.bits.ovp_active(),
                        ocp_active: raw.bits.ocp_active(),
                        opp_active: raw.bits.opp_active(),
                        otp_active: raw.bits.otp_active(),
                        act_voltage: telegram::from_raw(
                            raw.voltage_raw,
                            self.quantities.nom_voltage,
                        ),
                        act_current: telegram::from_raw(
                            raw.current_raw,
                            self.quantities.nom_current,
                        ),
                    }
                };
                fresh[output as usize] = state;
            }
            self.outputs = fresh;
        }
        Ok(self.outputs[..self.controllable_outputs as usize].to_vec())
    }

    /// Switch an output on.
    pub fn output_on(&mut self, output: u8) -> PsuResult<(), S::Error> {
        self.check_output(output)?;
        self.ensure_remote(output)?;
        self.send_control(
            output,
            control_bits::OUTPUT_MASK,
            control_bits::OUTPUT_ON,
            Some(ControlFlag::OutputOn),
        )
    }

    /// Switch an output off.
    pub fn output_off(&mut self, output: u8) -> PsuResult<(), S::Error> {
        self.check_output(output)?;
        self.ensure_remote(output)?;
        self.send_control(
            output,
            control_bits::OUTPUT_MASK,
            control_bits::OUTPUT_OFF,
            Some(ControlFlag::OutputOn),
        )
    }

    /// Switch every controllable output on.
    pub fn all_outputs_on(&mut self) -> PsuResult<(), S::Error> {
        for output in 0..self.controllable_outputs {
            self.output_on(output)?;
        }
        Ok(())
    }

    /// Switch every controllable output off.
    pub fn all_outputs_off(&mut self) -> PsuResult<(), S::Error> {
        for output in 0..self.controllable_outputs {
            self.output_off(output)?;
        }
        Ok(())
    }

    /// Couple output 2 to output 1. Only available on multi output models.
    pub fn tracking_on(&mut self) -> PsuResult<(), S::Error> {
        if self.controllable_outputs < 2 {
            return Err(PsuError::TrackingUnsupported);
        }
        self.ensure_remote(OUTPUT_1)?;
        self.send_control(
            OUTPUT_1,
            control_bits::TRACKING_MASK,
            control_bits::TRACKING_ON,
            None,
        )?;
        for state in self.outputs.iter_mut() {
            state.tracking_active = true;
        }
        Ok(())
    }

    /// Decouple output 2 from output 1.
    pub fn tracking_off(&mut self) -> PsuResult<(), S::Error> {
        if self.controllable_outputs < 2 {
            return Err(PsuError::TrackingUnsupported);
        }
        self.send_control(
            OUTPUT_1,
            control_bits::TRACKING_MASK,
            control_bits::TRACKING_OFF,
            None,
        )?;
        for state in self.outputs.iter_mut() {
            state.tracking_active = false;
        }
        Ok(())
    }

    /// Acknowledge tripped alarms.
    ///
    /// __Note:__ the device switches the output off when an alarm is
    /// acknowledged.
    pub fn reset_error(&mut self, output: u8) -> PsuResult<(), S::Error> {
        self.check_output(output)?;
        self.ensure_remote(output)?;
        self.send_control(
            output,
            control_bits::ACK_ALARMS_MASK,
            control_bits::ACK_ALARMS,
            None,
        )
    }

    /// Hand every output back to the front panel.
    ///
    /// While tracking is active only output 1 is released, the device refuses
    /// direct commands to output 2 in that mode.
    pub fn close(&mut self) -> PsuResult<(), S::Error> {
        for output in 0..self.controllable_outputs {
            if output > OUTPUT_1 && self.outputs[output as usize].tracking_active {
                continue;
            }
            self.remote_off(output)?;
        }
        Ok(())
    }
}
