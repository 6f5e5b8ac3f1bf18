//! Ramp/poll state machine and the hardware capability it drives.
//!
//! [`InstrumentController`] is device independent. Each device family implements
//! [`TemperatureHardware`] and the controller calls those hooks when a ramp is dispatched, a
//! single target is requested, or the program is stopped. Status events go out on a broadcast
//! channel after every poll tick.

pub mod instrument;

pub use instrument::{ControllerSnapshot, InstrumentController, CONVERGENCE_COUNT};

use crate::error::AppResult;
use crate::ramp::RampDescriptor;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Capability a temperature device exposes to the controller.
#[async_trait]
pub trait TemperatureHardware: Send + Sync + 'static {
    /// Transmit the parameters of ramp `index` without starting it.
    async fn send_ramp(&self, index: usize, ramp: &RampDescriptor) -> AppResult<()>;

    /// Begin executing the most recently sent ramp.
    async fn start_motion(&self) -> AppResult<()>;

    /// Single-shot move toward `target`.
    async fn move_to_target(&self, target: f64) -> AppResult<()>;

    /// Stop any motion.
    async fn halt(&self) -> AppResult<()>;

    /// Read the current temperature.
    async fn read_current_temperature(&self) -> AppResult<f64>;
}

#[async_trait]
impl<T: TemperatureHardware + ?Sized> TemperatureHardware for Arc<T> {
    async fn send_ramp(&self, index: usize, ramp: &RampDescriptor) -> AppResult<()> {
        (**self).send_ramp(index, ramp).await
    }

    async fn start_motion(&self) -> AppResult<()> {
        (**self).start_motion().await
    }

    async fn move_to_target(&self, target: f64) -> AppResult<()> {
        (**self).move_to_target(target).await
    }

    async fn halt(&self) -> AppResult<()> {
        (**self).halt().await
    }

    async fn read_current_temperature(&self) -> AppResult<f64> {
        (**self).read_current_temperature().await
    }
}

/// Limits, tolerance and poll periods.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    /// Lowest accepted target
    pub lower_temp: f64,
    /// Highest accepted target
    pub upper_temp: f64,
    /// Convergence tolerance in degrees
    pub accuracy: f64,
    /// Poll period while idle
    pub idle_poll: Duration,
    /// Poll period while moving
    pub busy_poll: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            lower_temp: -35.0,
            upper_temp: 200.0,
            accuracy: 0.1,
            idle_poll: Duration::from_secs(5),
            busy_poll: Duration::from_secs(1),
        }
    }
}

/// Derived controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No move in progress
    Idle,
    /// Moving up toward the set point
    Heating,
    /// Moving down toward the set point
    Cooling,
    /// At the end of a ramp, waiting for the dwell to elapse
    HoldingForTime,
    /// At the end of a ramp with no dwell pending (e.g. the next ramp failed to dispatch)
    HoldingAtLimit,
}

impl ControllerState {
    /// Name shown to observers.
    pub fn label(&self) -> &'static str {
        match self {
            ControllerState::Idle => "Idle",
            ControllerState::Heating => "Heating",
            ControllerState::Cooling => "Cooling",
            ControllerState::HoldingForTime => "HoldingForTime",
            ControllerState::HoldingAtLimit => "HoldingAtLimit",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One buffered reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Time since the run started
    pub elapsed: Duration,
    /// Reading in degrees
    pub temperature: f64,
}

impl Sample {
    /// `"<elapsed seconds, 2 decimals> <temperature>"`
    pub fn to_line(&self) -> String {
        format!("{:.2} {}", self.elapsed.as_secs_f64(), self.temperature)
    }
}

/// Status event sent to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureStatus {
    /// Latest reading
    pub current_temperature: f64,
    /// `None` while no ramp program is running
    pub current_ramp_index: Option<usize>,
    /// Derived state at the time of the event
    pub state: ControllerState,
    /// Sample line, or a failure message when the read failed
    pub free_text_sample: String,
}

impl TemperatureStatus {
    /// Label of [`state`](Self::state).
    pub fn state_label(&self) -> &'static str {
        self.state.label()
    }
}
