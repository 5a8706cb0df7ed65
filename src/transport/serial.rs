//! `serialport`-backed implementation of [`SerialLink`].

use std::io::Read;

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use crate::error::{Error, Result};
use crate::transport::{SerialLink, SerialSettings};

/// Platform adapter around a real serial device (USB-RS485 dongle, on-board
/// UART). Holds `None` while closed.
#[derive(Default)]
pub struct SerialPortLink {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(Error::NotConnected)
    }
}

impl SerialLink for SerialPortLink {
    fn open(&mut self, settings: &SerialSettings) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(settings.path.as_str(), settings.baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(settings.read_timeout)
            .open()
            .map_err(|err| Error::Transport(format!("failed to open {}: {err}", settings.path)))?;
        log::debug!(
            "opened {} at {} baud (8N1)",
            settings.path,
            settings.baudrate
        );
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the handle releases the device.
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        use std::io::Write;
        let port = self.port_mut()?;
        port.write_all(bytes)
            .and_then(|()| port.flush())
            .map_err(|err| Error::Transport(format!("serial write failed: {err}")))
    }

    fn bytes_available(&mut self) -> Result<usize> {
        let port = self.port_mut()?;
        port.bytes_to_read()
            .map(|n| n as usize)
            .map_err(|err| Error::Transport(format!("serial status failed: {err}")))
    }

    fn read_available(&mut self, max: usize) -> Result<Vec<u8>> {
        let buffered = self.bytes_available()?;
        let wanted = buffered.min(max);
        if wanted == 0 {
            return Ok(Vec::new());
        }
        let port = self.port_mut()?;
        let mut buf = vec![0u8; wanted];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(err) => Err(Error::Transport(format!("serial read failed: {err}"))),
        }
    }

    fn flush_input(&mut self) -> Result<()> {
        let port = self.port_mut()?;
        port.clear(ClearBuffer::Input)
            .map_err(|err| Error::Transport(format!("failed to clear input buffer: {err}")))
    }

    fn flush_output(&mut self) -> Result<()> {
        let port = self.port_mut()?;
        port.clear(ClearBuffer::Output)
            .map_err(|err| Error::Transport(format!("failed to clear output buffer: {err}")))
    }
}

/// Enumerate serial ports present on the system, sorted by name.
pub fn available_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => {
            let mut names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
            names.sort();
            log::debug!("found {} serial ports: {names:?}", names.len());
            names
        }
        Err(err) => {
            log::warn!("failed to enumerate serial ports: {err}");
            Vec::new()
        }
    }
}
