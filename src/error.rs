//! Error taxonomy for the Modbus RTU client.
//!
//! Every failure surfaces as exactly one [`Error`] variant with a stable tag
//! (see [`Error::tag`]); the transaction engine decides retries based on
//! [`Error::is_retriable`].

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller passed something out of range (quantity bounds, address
    /// overflow, unsupported function code, bad configuration).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted on a closed client.
    #[error("not connected to a serial device")]
    NotConnected,

    /// Serial open/read/write failure, wrapping the adapter's message.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Deadline elapsed without a structurally complete response.
    #[error("no complete response within {:.3}s", elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },

    /// Every CRC variant rejected the frame.
    #[error("CRC validation failed for frame {frame_hex}")]
    Crc { frame_hex: String },

    /// Structural impossibility: length mismatch, echo disagreement in
    /// strict mode, inconsistent byte count.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The device answered with a Modbus exception frame. Codes beyond the
    /// named ones pass through verbatim.
    #[error("device exception {code}: {}", describe_exception(*code))]
    Exception { code: u8 },
}

impl Error {
    /// Stable machine-readable identifier for the variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotConnected => "not_connected",
            Error::Transport(_) => "transport",
            Error::Timeout { .. } => "timeout",
            Error::Crc { .. } => "crc",
            Error::Protocol(_) => "protocol",
            Error::Exception { .. } => "exception",
        }
    }

    /// Whether the transaction engine may retry after this failure.
    ///
    /// `InvalidArgument` and `NotConnected` are immediate, and an exception
    /// frame is a definitive answer from the device, so none of those retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout { .. } | Error::Crc { .. } | Error::Protocol(_)
        )
    }
}

/// Human-readable description of a standard Modbus exception code.
pub fn describe_exception(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(Error::NotConnected.tag(), "not_connected");
        assert_eq!(Error::Exception { code: 2 }.tag(), "exception");
        assert_eq!(
            Error::Timeout {
                elapsed: Duration::from_millis(250)
            }
            .tag(),
            "timeout"
        );
    }

    #[test]
    fn test_retry_policy() {
        assert!(Error::Transport("boom".into()).is_retriable());
        assert!(Error::Crc {
            frame_hex: "01 01".into()
        }
        .is_retriable());
        assert!(!Error::Exception { code: 4 }.is_retriable());
        assert!(!Error::InvalidArgument("qty".into()).is_retriable());
        assert!(!Error::NotConnected.is_retriable());
    }

    #[test]
    fn test_exception_display_carries_code() {
        let message = Error::Exception { code: 2 }.to_string();
        assert!(message.contains("2"));
        assert!(message.contains("illegal data address"));
    }
}
