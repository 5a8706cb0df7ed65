//! Client facade: typed Modbus operations composed on the transaction
//! engine.
//!
//! One `Client` owns one serial link exclusively. Every operation runs as a
//! single transaction under the facade's lock, so concurrent callers
//! serialize and the adapter only ever sees non-overlapping
//! write/read sequences. Completed transactions feed the shared
//! [`StateTracker`] unless tracking is disabled in the configuration.

pub(crate) mod transaction;

use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::format_hex;
use crate::codec::frame::{self, Response};
use crate::config::{ClientConfig, SUPPORTED_BAUD_RATES};
use crate::error::{describe_exception, Error, Result};
use crate::state::{global_tracker, DeviceSnapshot, StateTracker};
use crate::transport::serial::SerialPortLink;
use crate::transport::SerialLink;

use transaction::TimingState;

/// Waveshare modules change their line rate through this holding register.
const BAUD_CODE_REGISTER: u16 = 0x2000;
/// Grace period for the device to re-clock after a baud-rate command.
const BAUD_SWITCH_SETTLE: Duration = Duration::from_secs(1);

struct Inner {
    link: Box<dyn SerialLink>,
    timing: TimingState,
}

pub struct Client {
    config: ClientConfig,
    inner: Mutex<Inner>,
    tracker: Option<StateTracker>,
}

impl Client {
    /// Client over a real serial device.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_link(config, Box::new(SerialPortLink::new()))
    }

    /// Client over an arbitrary [`SerialLink`] implementation (virtual
    /// ports, test doubles).
    pub fn with_link(config: ClientConfig, link: Box<dyn SerialLink>) -> Result<Self> {
        config.validate()?;
        let tracker = config.state_tracking.then(|| global_tracker().clone());
        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                link,
                timing: TimingState::default(),
            }),
            tracker,
        })
    }

    /// Use a dedicated tracker instead of the process-wide one. Ignored
    /// when the configuration disables state tracking.
    pub fn with_tracker(mut self, tracker: StateTracker) -> Self {
        if self.config.state_tracking {
            self.tracker = Some(tracker);
        }
        self
    }

    /// Open the client, run `operation`, and close again on every exit
    /// path. Panics unwind through the client's `Drop`, which also closes.
    pub fn with_open<T>(
        config: ClientConfig,
        operation: impl FnOnce(&Client) -> Result<T>,
    ) -> Result<T> {
        let client = Client::new(config)?;
        client.open()?;
        let result = operation(&client);
        client.close();
        result
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn tracker(&self) -> Option<&StateTracker> {
        self.tracker.as_ref()
    }

    /// Snapshot of this port's state for one unit (`None` = default unit).
    pub fn snapshot(&self, unit: Option<u8>) -> Option<DeviceSnapshot> {
        let unit = self.resolve_unit(unit);
        self.tracker
            .as_ref()
            .and_then(|tracker| tracker.snapshot(&self.config.port, unit))
    }

    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.link.is_open() {
            return Ok(());
        }
        inner.link.open(&self.config.serial_settings())?;
        log::info!(
            "connected to {} at {} baud",
            self.config.port,
            self.config.baudrate
        );
        Ok(())
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.link.is_open() {
            inner.link.close();
            log::info!("disconnected from {}", self.config.port);
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().link.is_open()
    }

    fn resolve_unit(&self, unit: Option<u8>) -> u8 {
        unit.unwrap_or(self.config.unit_id_default)
    }

    /// Run one transaction under the facade lock, feed the tracker, and
    /// reduce the response to its payload. A device exception comes back
    /// as [`Error::Exception`] without retries.
    fn run_transaction(&self, unit: u8, function: u8, request: &[u8]) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        if !inner.link.is_open() {
            return Err(Error::NotConnected);
        }
        let Inner { link, timing } = &mut *inner;
        let result =
            transaction::execute(link.as_mut(), timing, &self.config, request, unit, function);
        self.record_outcome(unit, &result);
        match result {
            Ok(Response::Normal { payload, .. }) => Ok(payload),
            Ok(Response::Exception { code, .. }) => Err(Error::Exception { code }),
            Err(err) => Err(err),
        }
    }

    fn record_outcome(&self, unit: u8, result: &Result<Response>) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        let port = &self.config.port;
        let baudrate = self.config.baudrate;
        tracker.record_request(port, baudrate, unit);
        match result {
            Ok(Response::Normal { crc, .. }) => {
                tracker.record_success(port, baudrate, unit);
                if !crc.is_standard() {
                    tracker.record_crc_bypass(port, baudrate, unit);
                }
            }
            Ok(Response::Exception { code, .. }) => tracker.record_error(
                port,
                baudrate,
                unit,
                &format!("device exception {code}: {}", describe_exception(*code)),
            ),
            Err(Error::Timeout { .. }) => tracker.record_timeout(port, baudrate, unit),
            Err(err) => tracker.record_error(port, baudrate, unit, &err.to_string()),
        }
    }

    fn track_coils(&self, unit: u8, address: u16, values: &[bool]) {
        if let Some(tracker) = &self.tracker {
            tracker.update_coils(&self.config.port, self.config.baudrate, unit, address, values);
        }
    }

    fn track_discrete_inputs(&self, unit: u8, address: u16, values: &[bool]) {
        if let Some(tracker) = &self.tracker {
            tracker.update_discrete_inputs(
                &self.config.port,
                self.config.baudrate,
                unit,
                address,
                values,
            );
        }
    }

    fn track_holding_registers(&self, unit: u8, address: u16, values: &[u16]) {
        if let Some(tracker) = &self.tracker {
            tracker.update_holding_registers(
                &self.config.port,
                self.config.baudrate,
                unit,
                address,
                values,
            );
        }
    }

    fn track_input_registers(&self, unit: u8, address: u16, values: &[u16]) {
        if let Some(tracker) = &self.tracker {
            tracker.update_input_registers(
                &self.config.port,
                self.config.baudrate,
                unit,
                address,
                values,
            );
        }
    }

    /// Read `quantity` coil states starting at `address`.
    pub fn read_coils(&self, unit: Option<u8>, address: u16, quantity: u16) -> Result<Vec<bool>> {
        let unit = self.resolve_unit(unit);
        let request = frame::build_read_request(unit, frame::READ_COILS, address, quantity)?;
        let payload = self.run_transaction(unit, frame::READ_COILS, &request)?;
        let values = frame::unpack_bits(&payload, quantity)?;
        self.track_coils(unit, address, &values);
        Ok(values)
    }

    /// Read `quantity` discrete-input states starting at `address`.
    pub fn read_discrete_inputs(
        &self,
        unit: Option<u8>,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>> {
        let unit = self.resolve_unit(unit);
        let request =
            frame::build_read_request(unit, frame::READ_DISCRETE_INPUTS, address, quantity)?;
        let payload = self.run_transaction(unit, frame::READ_DISCRETE_INPUTS, &request)?;
        let values = frame::unpack_bits(&payload, quantity)?;
        self.track_discrete_inputs(unit, address, &values);
        Ok(values)
    }

    /// Read `quantity` holding registers starting at `address`.
    ///
    /// With `waveshare_fallback` enabled, a failed standard read is retried
    /// once as the vendor function 0x43 before giving up.
    pub fn read_holding_registers(
        &self,
        unit: Option<u8>,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>> {
        let unit = self.resolve_unit(unit);
        let request =
            frame::build_read_request(unit, frame::READ_HOLDING_REGISTERS, address, quantity)?;
        let payload = match self.run_transaction(unit, frame::READ_HOLDING_REGISTERS, &request) {
            Ok(payload) => payload,
            Err(err) if self.config.waveshare_fallback && err.is_retriable() => {
                log::warn!(
                    "holding-register read failed ({err}); retrying with vendor function 0x{:02X}",
                    frame::VENDOR_READ_HOLDING_REGISTERS
                );
                let request = frame::build_read_request(
                    unit,
                    frame::VENDOR_READ_HOLDING_REGISTERS,
                    address,
                    quantity,
                )?;
                self.run_transaction(unit, frame::VENDOR_READ_HOLDING_REGISTERS, &request)?
            }
            Err(err) => return Err(err),
        };
        let values = frame::unpack_registers(&payload, quantity)?;
        self.track_holding_registers(unit, address, &values);
        Ok(values)
    }

    /// Read `quantity` input registers starting at `address`.
    pub fn read_input_registers(
        &self,
        unit: Option<u8>,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>> {
        let unit = self.resolve_unit(unit);
        let request =
            frame::build_read_request(unit, frame::READ_INPUT_REGISTERS, address, quantity)?;
        let payload = self.run_transaction(unit, frame::READ_INPUT_REGISTERS, &request)?;
        let values = frame::unpack_registers(&payload, quantity)?;
        self.track_input_registers(unit, address, &values);
        Ok(values)
    }

    /// Switch one coil, verifying the device echoes the request.
    pub fn write_single_coil(&self, unit: Option<u8>, address: u16, value: bool) -> Result<()> {
        let unit = self.resolve_unit(unit);
        let request = frame::build_write_single_coil(unit, address, value)?;
        let payload = self.run_transaction(unit, frame::WRITE_SINGLE_COIL, &request)?;
        verify_echo(&request[2..6], &payload)?;
        self.track_coils(unit, address, &[value]);
        Ok(())
    }

    /// Write one holding register, verifying the echo.
    pub fn write_single_register(&self, unit: Option<u8>, address: u16, value: u16) -> Result<()> {
        let unit = self.resolve_unit(unit);
        let request = frame::build_write_single_register(unit, address, value)?;
        let payload = self.run_transaction(unit, frame::WRITE_SINGLE_REGISTER, &request)?;
        verify_echo(&request[2..6], &payload)?;
        self.track_holding_registers(unit, address, &[value]);
        Ok(())
    }

    /// Write a run of coils; the response must echo address and quantity.
    pub fn write_multiple_coils(
        &self,
        unit: Option<u8>,
        address: u16,
        values: &[bool],
    ) -> Result<()> {
        let unit = self.resolve_unit(unit);
        let request = frame::build_write_multiple_coils(unit, address, values)?;
        let payload = self.run_transaction(unit, frame::WRITE_MULTIPLE_COILS, &request)?;
        verify_echo(&request[2..6], &payload)?;
        self.track_coils(unit, address, values);
        Ok(())
    }

    /// Write a run of holding registers; the response must echo address and
    /// quantity.
    pub fn write_multiple_registers(
        &self,
        unit: Option<u8>,
        address: u16,
        values: &[u16],
    ) -> Result<()> {
        let unit = self.resolve_unit(unit);
        let request = frame::build_write_multiple_registers(unit, address, values)?;
        let payload = self.run_transaction(unit, frame::WRITE_MULTIPLE_REGISTERS, &request)?;
        verify_echo(&request[2..6], &payload)?;
        self.track_holding_registers(unit, address, values);
        Ok(())
    }

    /// Command the device to re-clock its UART via the vendor baud-code
    /// register. `None` broadcasts (unit 0), in which case no response is
    /// expected and none is read.
    pub fn set_device_baudrate(&self, unit: Option<u8>, target_baudrate: u32) -> Result<()> {
        let code = baud_code(target_baudrate).ok_or_else(|| {
            Error::InvalidArgument(format!("no baud-rate code for {target_baudrate}"))
        })?;
        let unit = unit.unwrap_or(frame::BROADCAST_UNIT);
        if unit == frame::BROADCAST_UNIT {
            let request =
                frame::build_write_single_register(unit, BAUD_CODE_REGISTER, code)?;
            let mut inner = self.inner.lock();
            if !inner.link.is_open() {
                return Err(Error::NotConnected);
            }
            let Inner { link, timing } = &mut *inner;
            transaction::send_frame(link.as_mut(), timing, &self.config, &request)?;
            log::info!(
                "broadcast baud-rate change to {target_baudrate} (code {code}); \
                 no response expected"
            );
            return Ok(());
        }
        log::info!("setting unit {unit} baud rate to {target_baudrate} (code {code})");
        self.write_single_register(Some(unit), BAUD_CODE_REGISTER, code)
    }

    /// Move both the device and this client to a new line rate: command the
    /// device, reopen the port at the target rate, verify with a cheap
    /// read, and revert on failure.
    pub fn switch_baudrate(&mut self, unit: Option<u8>, target_baudrate: u32) -> Result<()> {
        if !SUPPORTED_BAUD_RATES.contains(&target_baudrate) {
            return Err(Error::InvalidArgument(format!(
                "unsupported baud rate {target_baudrate}"
            )));
        }
        let original = self.config.baudrate;
        if original == target_baudrate {
            return Ok(());
        }
        log::info!("switching {} from {original} to {target_baudrate} baud", self.config.port);
        self.set_device_baudrate(unit, target_baudrate)?;
        thread::sleep(BAUD_SWITCH_SETTLE);
        self.reopen_at(target_baudrate)?;

        // Broadcast commands cannot be verified against unit 0; fall back
        // to the configured default unit.
        let verify_unit = match unit {
            Some(frame::BROADCAST_UNIT) | None => self.config.unit_id_default,
            Some(unit) => unit,
        };
        match self.read_coils(Some(verify_unit), 0, 1) {
            Ok(_) => {
                log::info!("verified device at {target_baudrate} baud");
                Ok(())
            }
            Err(err) => {
                log::error!(
                    "no answer at {target_baudrate} baud ({err}); reverting to {original}"
                );
                self.reopen_at(original)?;
                self.set_device_baudrate(unit, original)?;
                Err(Error::Transport(format!(
                    "device did not answer at {target_baudrate} baud"
                )))
            }
        }
    }

    fn reopen_at(&mut self, baudrate: u32) -> Result<()> {
        self.config.baudrate = baudrate;
        let settings = self.config.serial_settings();
        let mut inner = self.inner.lock();
        inner.link.close();
        inner.link.open(&settings)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Compare a write response payload against the request bytes it must echo.
fn verify_echo(expected: &[u8], payload: &[u8]) -> Result<()> {
    if payload != expected {
        return Err(Error::Protocol(format!(
            "write echo mismatch: sent {}, got {}",
            format_hex(expected),
            format_hex(payload)
        )));
    }
    Ok(())
}

/// Waveshare baud-code table for register 0x2000.
fn baud_code(baudrate: u32) -> Option<u16> {
    match baudrate {
        4800 => Some(0),
        9600 => Some(1),
        19200 => Some(2),
        38400 => Some(3),
        57600 => Some(4),
        115200 => Some(5),
        _ => None,
    }
}
