//! Hardened Modbus RTU client for RS-232/RS-485 field devices.
//!
//! This crate is the request/response core of a Modbus RTU master: a
//! conforming frame codec, a transaction engine with adaptive timing and
//! retries, an auto-detection probe, and a per-unit device state tracker.
//! It is deliberately tolerant of the protocol deviations common in cheap
//! field hardware (Waveshare relay and analog modules in particular):
//! byte-swapped and otherwise non-standard CRCs, wrong function-code
//! echoes, broadcast unit-ID echoes and sluggish response timing. Every
//! tolerance is opt-in through [`ClientConfig`] and logged when it fires.
//!
//! ```no_run
//! use modrtu::{Client, ClientConfig};
//!
//! fn main() -> modrtu::Result<()> {
//!     let config = ClientConfig::new("/dev/ttyACM0", 9600);
//!     Client::with_open(config, |client| {
//!         let coils = client.read_coils(None, 0, 8)?;
//!         println!("coils: {coils:?}");
//!         client.write_single_coil(None, 0, true)?;
//!         Ok(())
//!     })
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod probe;
pub mod state;
pub mod transport;

pub use client::Client;
pub use codec::crc::CrcVariant;
pub use codec::frame::{CrcAcceptance, ParseOptions, Response};
pub use config::{ClientConfig, SUPPORTED_BAUD_RATES};
pub use error::{Error, Result};
pub use probe::{auto_detect, scan_all, DetectedDevice, ProbeOptions};
pub use state::{global_tracker, DeviceSnapshot, StateTracker};
pub use transport::serial::{available_ports, SerialPortLink};
pub use transport::{SerialLink, SerialSettings};
