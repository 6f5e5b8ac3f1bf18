//! Core library for the rust_thermo application.
//!
//! This library contains the serial link layer, the framed controller protocol, and the
//! ramp/poll state machine that drives temperature devices through ramp programs. It is used by
//! the `rust_thermo` command line tool and by integration tests.
//!
//! # Layers
//!
//! - [`link`]: one background reader per serial link and a timeout-bounded request/reply API
//! - [`protocol`]: checksum-framed encoding on top of a link
//! - [`controller`]: device-independent ramp/hold/poll state machine
//! - [`hardware`]: device families plugged into the controller

pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod hardware;
pub mod link;
pub mod logging;
pub mod profile;
pub mod protocol;
pub mod ramp;
pub mod scheduler;

pub use controller::{
    ControllerSettings, ControllerState, InstrumentController, TemperatureHardware,
    TemperatureStatus,
};
pub use error::{AppResult, ThermoError};
pub use link::{AsyncLinkTransceiver, ReplyBuffer, TransceiverBuilder};
pub use ramp::{RampDescriptor, RampProgram};
