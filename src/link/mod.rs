//! Serial link layer
//!
//! A link is any byte stream implementing [`LinkChannel`]: a `tokio-serial` port in production,
//! `tokio::io::duplex` in tests. On top of it sit the [`ReplyBuffer`] that recognises complete
//! replies and the [`AsyncLinkTransceiver`] that serialises command/reply exchanges.

pub mod reply_buffer;
pub mod transceiver;

pub use reply_buffer::{ReplyBuffer, ReplyChecker, TerminatorChecker};
pub use transceiver::{AsyncLinkTransceiver, TransceiverBuilder};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Raw byte-level link to an instrument.
///
/// Blanket-implemented for every async byte stream that can be split into independent read
/// and write halves.
pub trait LinkChannel: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> LinkChannel for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Parity modes for serial communication
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    /// Even parity bit
    Even,
    /// Odd parity bit
    Odd,
}

/// Flow control modes for serial communication
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// Timing parameters for a serial connection
#[derive(Clone, Debug)]
pub struct SerialLinkConfig {
    /// Path to the serial device (e.g., "/dev/ttyUSB0", "COM3")
    pub path: String,
    /// Baud rate (9600, 19200, etc.)
    pub baud_rate: u32,
    /// Data bits (7 or 8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Parity setting
    pub parity: Parity,
    /// Flow control setting
    pub flow_control: FlowControl,
    /// Driver-level timeout for a single read
    pub timeout: Duration,
}

impl Default for SerialLinkConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Open a serial port with the given timing parameters.
///
/// # Errors
/// Returns [`crate::error::ThermoError::Io`] carrying the driver's error kind if the port
/// cannot be opened, and
/// [`crate::error::ThermoError::Configuration`] for unsupported framing values.
#[cfg(feature = "tokio_serial")]
pub fn open_serial(config: &SerialLinkConfig) -> crate::error::AppResult<tokio_serial::SerialStream> {
    use crate::error::ThermoError;
    use tokio_serial::SerialPortBuilderExt;

    let data_bits = match config.data_bits {
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => {
            return Err(ThermoError::Configuration(format!(
                "unsupported data bits: {other}"
            )))
        }
    };
    let stop_bits = match config.stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => {
            return Err(ThermoError::Configuration(format!(
                "unsupported stop bits: {other}"
            )))
        }
    };
    let parity = match config.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    };
    let flow_control = match config.flow_control {
        FlowControl::None => tokio_serial::FlowControl::None,
        FlowControl::Software => tokio_serial::FlowControl::Software,
        FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
    };

    let port = tokio_serial::new(&config.path, config.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(flow_control)
        .timeout(config.timeout)
        .open_native_async()
        .map_err(|e| open_error(&config.path, e))?;

    tracing::info!(port = %config.path, baud = config.baud_rate, "serial port opened");
    Ok(port)
}

/// Keeps the driver's error kind so callers can tell a missing port from a busy or denied one.
#[cfg(feature = "tokio_serial")]
fn open_error(path: &str, e: tokio_serial::Error) -> crate::error::ThermoError {
    let source = std::io::Error::from(e);
    crate::error::ThermoError::Io(std::io::Error::new(
        source.kind(),
        format!("failed to open serial port '{path}': {source}"),
    ))
}
