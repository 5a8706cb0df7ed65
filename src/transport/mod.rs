//! Byte-level serial port abstraction.
//!
//! The client core depends only on the [`SerialLink`] contract; the
//! `serialport`-backed implementation lives in [`serial`] and any other
//! platform adapter (virtual ports in tests, pseudo-terminals in CI) can be
//! swapped in through `Client::with_link`.

pub mod serial;

use std::time::Duration;

use crate::error::Result;

/// Upper bound for a single low-level read. Keeps `read_available` from
/// stalling the progressive-read loop when the driver has nothing buffered.
pub const LOW_LEVEL_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Line parameters handed to [`SerialLink::open`]. Modbus RTU is fixed at
/// 8 data bits, no parity, 1 stop bit, so only the path and rate vary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub path: String,
    pub baudrate: u32,
    pub read_timeout: Duration,
}

impl SerialSettings {
    pub fn new(path: impl Into<String>, baudrate: u32) -> Self {
        Self {
            path: path.into(),
            baudrate,
            read_timeout: LOW_LEVEL_READ_TIMEOUT,
        }
    }
}

/// Synchronous byte-level port I/O as the transaction engine consumes it.
///
/// All operations block at most for the configured low-level timeout;
/// `read_available` returns promptly with whatever is currently buffered,
/// possibly nothing.
pub trait SerialLink: Send {
    /// Open (or reopen) the port with the given line parameters.
    fn open(&mut self, settings: &SerialSettings) -> Result<()>;

    /// Close the port. Closing an already closed link is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Write the whole frame; a short write is a transport failure.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Number of bytes the driver has buffered for reading.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Read up to `max` buffered bytes without waiting for more to arrive.
    fn read_available(&mut self, max: usize) -> Result<Vec<u8>>;

    /// Discard anything buffered on the receive side.
    fn flush_input(&mut self) -> Result<()>;

    /// Discard anything still queued on the transmit side.
    fn flush_output(&mut self) -> Result<()>;
}
