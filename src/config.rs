//! Client configuration surface.
//!
//! Everything a facade needs to talk to one bus: line parameters, timing,
//! retry budget and the leniency switches for non-conforming devices. The
//! struct deserializes from the same JSON/TOML shapes the outer services
//! use, with every field optional.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::frame;
use crate::error::{Error, Result};
use crate::transport::SerialSettings;

/// Baud rates the client will accept. Matches what the supported RS-485
/// transceivers can actually clock.
pub const SUPPORTED_BAUD_RATES: &[u32] =
    &[1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

/// Floor for the pause between outbound frames. 3.5 character times shrinks
/// below this on fast links, but half-duplex converters still need the gap.
pub const MIN_INTER_FRAME_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Serial device path, e.g. `/dev/ttyACM0` or `COM3`.
    pub port: String,
    /// Line rate; must be one of [`SUPPORTED_BAUD_RATES`].
    pub baudrate: u32,
    /// Per-attempt response deadline in seconds.
    pub timeout_seconds: f32,
    /// Unit ID used when an operation does not name one.
    pub unit_id_default: u8,
    /// Additional attempts after the first failure.
    pub retries: u8,
    /// Minimum pause between outbound frames. `None` derives 3.5 character
    /// times from the baud rate; either way the value is clamped to at
    /// least [`MIN_INTER_FRAME_DELAY`].
    pub inter_frame_delay_ms: Option<u32>,
    /// Accept non-standard CRC variants on read responses.
    pub lenient_crc: bool,
    /// Accept whitelisted function-code echoes.
    pub lenient_function_code: bool,
    /// Accept broadcast or mismatched unit-ID echoes.
    pub lenient_unit_id: bool,
    /// Keep per-unit snapshots and counters in the state tracker.
    pub state_tracking: bool,
    /// Retry failed holding-register reads with the vendor function 0x43.
    pub waveshare_fallback: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baudrate: 9600,
            timeout_seconds: 1.0,
            unit_id_default: 1,
            retries: 2,
            inter_frame_delay_ms: None,
            lenient_crc: false,
            lenient_function_code: true,
            lenient_unit_id: false,
            state_tracking: true,
            waveshare_fallback: false,
        }
    }
}

impl ClientConfig {
    pub fn new(port: impl Into<String>, baudrate: u32) -> Self {
        Self {
            port: port.into(),
            baudrate,
            ..Self::default()
        }
    }

    /// Check the invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(Error::InvalidArgument("port path is empty".to_string()));
        }
        if !SUPPORTED_BAUD_RATES.contains(&self.baudrate) {
            return Err(Error::InvalidArgument(format!(
                "unsupported baud rate {} (supported: {SUPPORTED_BAUD_RATES:?})",
                self.baudrate
            )));
        }
        if self.unit_id_default > frame::MAX_UNIT_ID {
            return Err(Error::InvalidArgument(format!(
                "default unit ID {} out of range 0-{}",
                self.unit_id_default,
                frame::MAX_UNIT_ID
            )));
        }
        let floor = 3.5 * self.char_time().as_secs_f32();
        if !self.timeout_seconds.is_finite() || self.timeout_seconds < floor {
            return Err(Error::InvalidArgument(format!(
                "timeout {}s is below 3.5 character times ({floor:.6}s) at {} baud",
                self.timeout_seconds, self.baudrate
            )));
        }
        Ok(())
    }

    /// Per-attempt deadline as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f32(self.timeout_seconds)
    }

    /// Duration of one 10-bit character (start + 8 data + stop) on the wire.
    pub fn char_time(&self) -> Duration {
        Duration::from_secs_f64(10.0 / f64::from(self.baudrate))
    }

    /// Effective minimum pause between outbound frames.
    pub fn inter_frame_delay(&self) -> Duration {
        let configured = match self.inter_frame_delay_ms {
            Some(ms) => Duration::from_millis(u64::from(ms)),
            None => self.char_time().mul_f64(3.5),
        };
        configured.max(MIN_INTER_FRAME_DELAY)
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(&self.port, self.baudrate)
    }

    pub(crate) fn parse_options(&self) -> frame::ParseOptions {
        frame::ParseOptions {
            lenient_crc: self.lenient_crc,
            lenient_function_code: self.lenient_function_code,
            lenient_unit_id: self.lenient_unit_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.unit_id_default, 1);
        assert_eq!(config.retries, 2);
        assert!(!config.lenient_crc);
        assert!(config.lenient_function_code);
        assert!(!config.lenient_unit_id);
        assert!(config.state_tracking);
    }

    #[test]
    fn test_rejects_odd_baud_rate() {
        let config = ClientConfig::new("/dev/ttyUSB0", 14400);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_timeout_below_char_budget() {
        let mut config = ClientConfig::new("/dev/ttyUSB0", 1200);
        // 3.5 character times at 1200 baud is about 29 ms.
        config.timeout_seconds = 0.01;
        assert!(config.validate().is_err());
        config.timeout_seconds = 0.1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inter_frame_delay_is_clamped() {
        let mut config = ClientConfig::new("/dev/ttyUSB0", 115200);
        // 3.5 character times at 115200 baud is ~0.3 ms; the floor wins.
        assert_eq!(config.inter_frame_delay(), MIN_INTER_FRAME_DELAY);
        config.inter_frame_delay_ms = Some(25);
        assert_eq!(config.inter_frame_delay(), Duration::from_millis(25));
        config.inter_frame_delay_ms = Some(2);
        assert_eq!(config.inter_frame_delay(), MIN_INTER_FRAME_DELAY);
        config.baudrate = 1200;
        config.inter_frame_delay_ms = None;
        // 3.5 * 10 bits / 1200 baud ≈ 29 ms, above the floor.
        assert!(config.inter_frame_delay() > MIN_INTER_FRAME_DELAY);
    }

    #[test]
    fn test_deserializes_with_partial_fields() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"port": "/dev/ttyUSB1", "lenient_crc": true}"#).unwrap();
        assert_eq!(config.port, "/dev/ttyUSB1");
        assert!(config.lenient_crc);
        assert_eq!(config.baudrate, 9600);
    }
}
