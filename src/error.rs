//! Custom error types for the crate.
//!
//! This module defines the primary error type, `ThermoError`, shared by the link layer, the
//! framed protocol codec and the ramp controller. Using the `thiserror` crate, it provides a
//! single place where every failure the instrument-control stack can report is named.
//!
//! ## Error Hierarchy
//!
//! - **Link**: `Io`, `Timeout`, `BufferOverflow`, `ReaderStopped`, `InvalidCommand`. Raw
//!   serial failures are retried by the background reader; a caller only ever sees them as a
//!   `Timeout` unless the write itself failed.
//! - **Protocol**: `Checksum`, `SpuriousReply`, `NegativeAcknowledgement`, `MalformedReply`.
//!   Always surfaced to the caller, never retried.
//! - **Controller usage**: `EmptyProgram`, `OutOfRange`, `AlreadyBusy`. Reported synchronously
//!   before any hardware I/O is attempted.
//! - **Ambient**: `Hardware`, `Configuration`, `Config`, `Profile`, `Sink`, `FeatureNotEnabled`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, ThermoError>;

/// Errors raised by the link, protocol, controller and ambient layers.
#[derive(Error, Debug)]
pub enum ThermoError {
    /// Link or file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No complete reply before the deadline
    #[error("No complete reply within {timeout:?}")]
    Timeout {
        /// Configured reply timeout
        timeout: Duration,
    },

    /// Reply exceeded the buffer capacity
    #[error("Reply buffer overflow: {capacity} units without a complete reply")]
    BufferOverflow {
        /// Buffer capacity in units
        capacity: usize,
    },

    /// Link closed or transceiver shut down
    #[error("Background reader has stopped (link closed)")]
    ReaderStopped,

    /// Command character outside Latin-1
    #[error("Command contains character {0:?} which is not a single link unit")]
    InvalidCommand(char),

    /// Reply BCC did not match
    #[error("Checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    Checksum {
        /// BCC computed over the received frame
        computed: u8,
        /// BCC carried by the frame
        received: u8,
    },

    /// Reply started with an unexpected byte
    #[error("Spurious reply: unexpected leading byte {0:#04x}")]
    SpuriousReply(u8),

    /// Device sent NAK
    #[error("Device replied with a negative acknowledgement")]
    NegativeAcknowledgement,

    /// Reply framing was incomplete or invalid
    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    /// Program started with no ramps
    #[error("Ramp program is empty")]
    EmptyProgram,

    /// Target outside the controller limits
    #[error("Temperature {value} outside limits [{lower}, {upper}]")]
    OutOfRange {
        /// Rejected temperature
        value: f64,
        /// Lowest accepted temperature
        lower: f64,
        /// Highest accepted temperature
        upper: f64,
    },

    /// A move or program is already in progress
    #[error("Controller is already moving to a temperature; stop it first")]
    AlreadyBusy,

    /// Device hook failed
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Invalid settings or ramp values
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Profile text could not be parsed
    #[error("Profile format error: {0}")]
    Profile(String),

    /// Data sink failed
    #[error("Data sink error: {0}")]
    Sink(String),

    /// Cargo feature required for this operation is off
    #[error("Feature not enabled: {0}")]
    FeatureNotEnabled(String),
}

impl ThermoError {
    /// True for errors that mean the device did not answer at all.
    pub fn is_unresponsive(&self) -> bool {
        matches!(self, ThermoError::Timeout { .. } | ThermoError::ReaderStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ThermoError::OutOfRange {
            value: 250.0,
            lower: -35.0,
            upper: 200.0,
        };
        assert_eq!(err.to_string(), "Temperature 250 outside limits [-35, 200]");
    }

    #[test]
    fn test_checksum_display_is_hex() {
        let err = ThermoError::Checksum {
            computed: 0x1f,
            received: 0x20,
        };
        assert!(err.to_string().contains("0x1f"));
        assert!(err.to_string().contains("0x20"));
    }

    #[test]
    fn test_unresponsive_classification() {
        assert!(ThermoError::Timeout {
            timeout: Duration::from_millis(10)
        }
        .is_unresponsive());
        assert!(ThermoError::ReaderStopped.is_unresponsive());
        assert!(!ThermoError::NegativeAcknowledgement.is_unresponsive());
    }
}
