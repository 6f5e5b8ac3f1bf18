//! Mock Hardware Implementations
//!
//! Provides simulated temperature devices for testing without physical hardware.
//!
//! # Available Mocks
//!
//! - `FurnaceModel` - deterministic first-order furnace shared by every simulator
//! - `SimulatedFurnace` - [`TemperatureHardware`] implementation over a `FurnaceModel`
//!
//! # Behaviour
//!
//! The model moves a fixed number of degrees toward its setpoint on every reading, so a test
//! knows exactly how many polls a ramp takes. Optional alternating noise is added to readings.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::controller::TemperatureHardware;
use crate::error::{AppResult, ThermoError};
use crate::ramp::RampDescriptor;

// =============================================================================
// FurnaceModel
// =============================================================================

/// Deterministic furnace physics.
#[derive(Debug, Clone, PartialEq)]
pub struct FurnaceModel {
    /// True (noise-free) temperature
    pub temperature: f64,
    /// Commanded setpoint
    pub set_point: f64,
    /// Commanded ramp rate in degrees per minute (informational)
    pub rate: f64,
    /// Whether the furnace is driving toward the setpoint
    pub running: bool,
    /// Degrees moved per reading
    pub step: f64,
    /// Amplitude of alternating reading noise
    pub noise: f64,
    readings: u64,
}

impl FurnaceModel {
    /// Furnace resting at `temperature` with a 5 degree step.
    pub fn new(temperature: f64) -> Self {
        Self {
            temperature,
            set_point: temperature,
            rate: 0.0,
            running: false,
            step: 5.0,
            noise: 0.0,
            readings: 0,
        }
    }

    /// Set the degrees moved per reading.
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step.abs();
        self
    }

    /// Alternate readings by `noise` above and below the true temperature.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.abs();
        self
    }

    /// Move one step toward the setpoint (if running) and return a reading.
    pub fn advance(&mut self) -> f64 {
        if self.running {
            let distance = self.set_point - self.temperature;
            self.temperature += self.step.min(distance.abs()).copysign(distance);
        }
        self.readings += 1;
        let sign = if self.readings % 2 == 0 { -1.0 } else { 1.0 };
        self.temperature + sign * self.noise
    }

    /// Number of readings taken so far.
    pub fn readings(&self) -> u64 {
        self.readings
    }
}

// =============================================================================
// SimulatedFurnace
// =============================================================================

/// Hook invocation recorded by [`SimulatedFurnace`].
#[derive(Debug, Clone, PartialEq)]
pub enum FurnaceCall {
    /// Ramp parameters transmitted
    SendRamp {
        /// Position in the program
        index: usize,
        /// Ramp end temperature
        end: f64,
        /// Ramp rate in degrees per minute
        rate: f64,
    },
    /// Last sent ramp started
    StartMotion,
    /// Single-shot move requested
    MoveToTarget(f64),
    /// Motion stopped
    Halt,
}

/// Simulated furnace with call recording and fault injection
///
/// # Example
///
/// ```
/// use rust_thermo::controller::TemperatureHardware;
/// use rust_thermo::hardware::{FurnaceModel, SimulatedFurnace};
///
/// # tokio_test::block_on(async {
/// let furnace = SimulatedFurnace::new(FurnaceModel::new(20.0).with_step(10.0));
/// furnace.move_to_target(50.0).await.unwrap();
/// assert_eq!(furnace.read_current_temperature().await.unwrap(), 30.0);
/// # });
/// ```
pub struct SimulatedFurnace {
    model: Arc<RwLock<FurnaceModel>>,
    calls: Mutex<Vec<FurnaceCall>>,
    failing_reads: AtomicU32,
    failing_dispatches: AtomicU32,
}

impl SimulatedFurnace {
    /// Furnace owning its own model.
    pub fn new(model: FurnaceModel) -> Self {
        Self::with_shared_model(Arc::new(RwLock::new(model)))
    }

    /// Share the model with another simulator (e.g. a wire-level device).
    pub fn with_shared_model(model: Arc<RwLock<FurnaceModel>>) -> Self {
        Self {
            model,
            calls: Mutex::new(Vec::new()),
            failing_reads: AtomicU32::new(0),
            failing_dispatches: AtomicU32::new(0),
        }
    }

    /// Shared handle to the model.
    pub fn model(&self) -> Arc<RwLock<FurnaceModel>> {
        Arc::clone(&self.model)
    }

    /// Recorded hook invocations.
    pub async fn calls(&self) -> Vec<FurnaceCall> {
        self.calls.lock().await.clone()
    }

    /// Make the next `count` temperature reads fail.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` ramp transmissions fail.
    pub fn fail_next_dispatches(&self, count: u32) {
        self.failing_dispatches.store(count, Ordering::SeqCst);
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn record(&self, call: FurnaceCall) {
        debug!(?call, "simulated furnace");
        self.calls.lock().await.push(call);
    }
}

impl Default for SimulatedFurnace {
    fn default() -> Self {
        Self::new(FurnaceModel::new(20.0))
    }
}

#[async_trait]
impl TemperatureHardware for SimulatedFurnace {
    async fn send_ramp(&self, index: usize, ramp: &RampDescriptor) -> AppResult<()> {
        if Self::take_fault(&self.failing_dispatches) {
            return Err(ThermoError::Hardware(format!(
                "simulated failure sending ramp {index}"
            )));
        }
        {
            let mut model = self.model.write().await;
            model.set_point = ramp.end;
            model.rate = ramp.rate;
            model.running = false;
        }
        self.record(FurnaceCall::SendRamp {
            index,
            end: ramp.end,
            rate: ramp.rate,
        })
        .await;
        Ok(())
    }

    async fn start_motion(&self) -> AppResult<()> {
        self.model.write().await.running = true;
        self.record(FurnaceCall::StartMotion).await;
        Ok(())
    }

    async fn move_to_target(&self, target: f64) -> AppResult<()> {
        {
            let mut model = self.model.write().await;
            model.set_point = target;
            model.running = true;
        }
        self.record(FurnaceCall::MoveToTarget(target)).await;
        Ok(())
    }

    async fn halt(&self) -> AppResult<()> {
        self.model.write().await.running = false;
        self.record(FurnaceCall::Halt).await;
        Ok(())
    }

    async fn read_current_temperature(&self) -> AppResult<f64> {
        if Self::take_fault(&self.failing_reads) {
            return Err(ThermoError::Timeout {
                timeout: std::time::Duration::from_secs(10),
            });
        }
        Ok(self.model.write().await.advance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_steps_toward_setpoint() {
        let mut model = FurnaceModel::new(20.0).with_step(10.0);
        model.set_point = 45.0;
        assert_eq!(model.advance(), 20.0);

        model.running = true;
        assert_eq!(model.advance(), 30.0);
        assert_eq!(model.advance(), 40.0);
        assert_eq!(model.advance(), 45.0);
        assert_eq!(model.advance(), 45.0);

        model.set_point = 38.0;
        assert_eq!(model.advance(), 38.0);
        assert_eq!(model.readings(), 6);
    }

    #[test]
    fn test_model_noise_alternates() {
        let mut model = FurnaceModel::new(20.0).with_noise(0.5);
        assert_eq!(model.advance(), 20.5);
        assert_eq!(model.advance(), 19.5);
        assert_eq!(model.advance(), 20.5);
    }

    #[tokio::test]
    async fn test_simulated_furnace_records_calls() {
        let furnace = SimulatedFurnace::new(FurnaceModel::new(20.0).with_step(10.0));
        furnace
            .send_ramp(0, &RampDescriptor::new(20.0, 50.0, 10.0, 0.0))
            .await
            .unwrap();
        assert_eq!(furnace.read_current_temperature().await.unwrap(), 20.0);

        furnace.start_motion().await.unwrap();
        assert_eq!(furnace.read_current_temperature().await.unwrap(), 30.0);
        furnace.halt().await.unwrap();

        assert_eq!(
            furnace.calls().await,
            vec![
                FurnaceCall::SendRamp {
                    index: 0,
                    end: 50.0,
                    rate: 10.0
                },
                FurnaceCall::StartMotion,
                FurnaceCall::Halt,
            ]
        );
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let furnace = SimulatedFurnace::default();
        furnace.fail_next_reads(1);
        assert!(furnace.read_current_temperature().await.is_err());
        assert!(furnace.read_current_temperature().await.is_ok());

        furnace.fail_next_dispatches(1);
        let ramp = RampDescriptor::new(20.0, 30.0, 1.0, 0.0);
        assert!(furnace.send_ramp(0, &ramp).await.is_err());
        assert!(furnace.send_ramp(0, &ramp).await.is_ok());
    }
}
