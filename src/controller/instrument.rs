//! Ramp/poll state machine.
//!
//! All mutable state lives behind one async mutex, and every transition (including the hardware
//! hooks it calls) happens while that lock is held. `running`, `current_ramp` and `busy` are
//! therefore never observed half-updated.
//!
//! # Lifecycle
//!
//! ```text
//! start() ──► dispatch ramp 0 ──► busy ──(5 polls in tolerance)──► dwell > 0 ? hold timer
//!                  ▲                                                  │            │
//!                  └────────────── next ramp ◄────────────────────────┴── fired ◄──┘
//!                                     │ past the end
//!                                     ▼
//!                                   stop()
//! ```

use super::{
    ControllerSettings, ControllerState, Sample, TemperatureHardware, TemperatureStatus,
};
use crate::data::DataSink;
use crate::error::{AppResult, ThermoError};
use crate::ramp::{RampDescriptor, RampProgram};
use crate::scheduler::{ScheduledCallback, Scheduler, TaskHandle};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Consecutive in-tolerance polls required before the device counts as at target.
pub const CONVERGENCE_COUNT: u32 = 5;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Point-in-time copy of the controller's state.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSnapshot {
    /// Derived state
    pub state: ControllerState,
    /// A ramp program is active
    pub running: bool,
    /// The device is moving toward `target_temperature`
    pub busy: bool,
    /// Index of the ramp being executed
    pub current_ramp: Option<usize>,
    /// Target of the current move or ramp
    pub target_temperature: f64,
    /// Last value commanded to the hardware
    pub set_point: f64,
    /// Latest reading
    pub current_temperature: f64,
    /// Consecutive polls within tolerance of the target
    pub in_tolerance_count: u32,
    /// A dwell is counting down
    pub hold_timer_pending: bool,
    /// `None` while no poller is scheduled
    pub poll_period: Option<Duration>,
}

struct ControllerInner {
    program: RampProgram,
    current_ramp: Option<usize>,
    target_temperature: f64,
    current_temperature: f64,
    set_point: f64,
    busy: bool,
    running: bool,
    in_tolerance: u32,
    /// Set when the current ramp could not be sent; retried on the next poll.
    dispatch_pending: bool,
    hold_timer: Option<TaskHandle>,
    /// Bumped on every start/stop so stale hold timers are ignored.
    generation: u64,
    poller: Option<TaskHandle>,
    poll_period: Duration,
    next_poll_at: Instant,
    started_at: Option<Instant>,
    samples: Vec<Sample>,
    sink: Option<Box<dyn DataSink>>,
    sink_open: bool,
}

impl ControllerInner {
    fn state(&self) -> ControllerState {
        if self.hold_timer.is_some() {
            ControllerState::HoldingForTime
        } else if self.busy {
            if self.set_point > self.current_temperature {
                ControllerState::Heating
            } else {
                ControllerState::Cooling
            }
        } else if self.running {
            ControllerState::HoldingAtLimit
        } else {
            ControllerState::Idle
        }
    }

    fn elapsed(&self) -> Duration {
        self.started_at.map_or(Duration::ZERO, |start| start.elapsed())
    }

    fn status(&self, free_text: String) -> TemperatureStatus {
        TemperatureStatus {
            current_temperature: self.current_temperature,
            current_ramp_index: self.current_ramp,
            state: self.state(),
            free_text_sample: free_text,
        }
    }

    fn default_free_text(&self) -> String {
        Sample {
            elapsed: self.elapsed(),
            temperature: self.current_temperature,
        }
        .to_line()
    }
}

/// Drives a [`TemperatureHardware`] device through a [`RampProgram`].
///
/// Constructed as an `Arc` so scheduled callbacks can hold a weak reference back to it; dropping
/// the last strong reference turns any still-scheduled callbacks into no-ops.
pub struct InstrumentController<H: TemperatureHardware> {
    hardware: H,
    scheduler: Arc<dyn Scheduler>,
    settings: ControllerSettings,
    inner: Mutex<ControllerInner>,
    status_tx: broadcast::Sender<TemperatureStatus>,
    this: Weak<Self>,
}

impl<H: TemperatureHardware> InstrumentController<H> {
    /// Create an idle controller with an empty program. No poller runs until a move starts.
    pub fn new(
        hardware: H,
        scheduler: Arc<dyn Scheduler>,
        settings: ControllerSettings,
    ) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let idle_poll = settings.idle_poll;
        Arc::new_cyclic(|this| Self {
            hardware,
            scheduler,
            settings,
            inner: Mutex::new(ControllerInner {
                program: RampProgram::default(),
                current_ramp: None,
                target_temperature: 0.0,
                current_temperature: 0.0,
                set_point: 0.0,
                busy: false,
                running: false,
                in_tolerance: 0,
                dispatch_pending: false,
                hold_timer: None,
                generation: 0,
                poller: None,
                poll_period: idle_poll,
                next_poll_at: Instant::now(),
                started_at: None,
                samples: Vec::new(),
                sink: None,
                sink_open: false,
            }),
            status_tx,
            this: this.clone(),
        })
    }

    /// Limits and poll periods this controller was built with.
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// The device being driven.
    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    /// Register an observer for status events.
    pub fn subscribe(&self) -> broadcast::Receiver<TemperatureStatus> {
        self.status_tx.subscribe()
    }

    // ------------------------------------------------------------------------
    // Program editing
    // ------------------------------------------------------------------------

    /// Replace the ramp program.
    ///
    /// While a program is running only the entries after the current ramp are replaced.
    ///
    /// # Errors
    /// - [`ThermoError::Configuration`] if any ramp is malformed
    /// - [`ThermoError::OutOfRange`] if any ramp ends outside the configured limits
    pub async fn set_ramps(&self, program: RampProgram) -> AppResult<()> {
        program.validate()?;
        program
            .ramps()
            .iter()
            .try_for_each(|ramp| self.check_limits(ramp.end))?;
        let mut inner = self.inner.lock().await;
        match (inner.running, inner.current_ramp) {
            (true, Some(current)) => {
                inner.program.replace_after(current, &program);
                info!(current, ramps = inner.program.len(), "revised pending ramps");
            }
            _ => inner.program = program,
        }
        Ok(())
    }

    /// Append one ramp. Rejected under the same rules as [`set_ramps`](Self::set_ramps).
    pub async fn add_ramp(&self, ramp: RampDescriptor) -> AppResult<()> {
        ramp.validate()?;
        self.check_limits(ramp.end)?;
        self.inner.lock().await.program.push(ramp);
        Ok(())
    }

    /// Remove ramps. A running program keeps the ramps already dispatched.
    pub async fn clear_ramps(&self) {
        let mut inner = self.inner.lock().await;
        match (inner.running, inner.current_ramp) {
            (true, Some(current)) => inner
                .program
                .replace_after(current, &RampProgram::default()),
            _ => inner.program.clear(),
        }
    }

    /// Copy of the current program.
    pub async fn ramps(&self) -> RampProgram {
        self.inner.lock().await.program.clone()
    }

    /// Attach a sink that receives one line per poll tick while a run is active.
    pub async fn attach_sink(&self, sink: Box<dyn DataSink>) {
        let mut inner = self.inner.lock().await;
        if inner.sink_open {
            if let Some(mut old) = inner.sink.take() {
                if let Err(e) = old.close().await {
                    warn!(error = %e, "failed to close replaced sink");
                }
            }
        }
        inner.sink = Some(sink);
        inner.sink_open = false;
        if inner.started_at.is_some() {
            Self::open_sink(&mut inner).await;
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Start the ramp program from its first ramp.
    ///
    /// # Errors
    /// - [`ThermoError::EmptyProgram`] if no ramps are defined
    /// - [`ThermoError::AlreadyBusy`] if a program or single move is in progress
    /// - hardware errors from dispatching ramp 0; the controller stays idle
    pub async fn start(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let first = *inner.program.get(0).ok_or(ThermoError::EmptyProgram)?;
        if inner.running || inner.busy {
            return Err(ThermoError::AlreadyBusy);
        }

        self.hardware.send_ramp(0, &first).await?;
        self.hardware.start_motion().await?;

        inner.generation += 1;
        inner.running = true;
        inner.current_ramp = Some(0);
        inner.target_temperature = first.end;
        inner.set_point = first.end;
        inner.busy = true;
        inner.in_tolerance = 0;
        inner.dispatch_pending = false;
        Self::begin_run(&mut inner).await;
        self.reschedule_poller(&mut inner, self.settings.busy_poll, true);

        info!(ramps = inner.program.len(), end = first.end, rate = first.rate, "ramp program started");
        self.emit(&inner, inner.default_free_text());
        Ok(())
    }

    /// Single-shot move to `target`.
    ///
    /// # Errors
    /// - [`ThermoError::OutOfRange`] if `target` is outside the configured limits
    /// - [`ThermoError::AlreadyBusy`] if a move or program is in progress
    pub async fn set_target_temperature(&self, target: f64) -> AppResult<()> {
        self.check_limits(target)?;

        let mut inner = self.inner.lock().await;
        if inner.busy || inner.running {
            return Err(ThermoError::AlreadyBusy);
        }

        self.hardware.move_to_target(target).await?;

        inner.target_temperature = target;
        inner.set_point = target;
        inner.busy = true;
        inner.in_tolerance = 0;
        Self::begin_run(&mut inner).await;
        self.reschedule_poller(&mut inner, self.settings.busy_poll, true);

        info!(target, "moving to target temperature");
        self.emit(&inner, inner.default_free_text());
        Ok(())
    }

    /// Stop the program or move, halt the hardware and fall back to idle polling.
    ///
    /// The state is reset even if the halt hook fails; the hook's error is returned.
    pub async fn stop(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let result = self.stop_locked(&mut inner).await;
        self.emit(&inner, inner.default_free_text());
        result
    }

    /// One poll cycle: read, record, check convergence, notify.
    pub async fn poll_tick(&self) {
        let mut inner = self.inner.lock().await;
        inner.next_poll_at = Instant::now() + inner.poll_period;

        if inner.running && inner.dispatch_pending {
            self.dispatch_current(&mut inner).await;
        }

        match self.hardware.read_current_temperature().await {
            Ok(temperature) => inner.current_temperature = temperature,
            Err(e) => {
                inner.in_tolerance = 0;
                if e.is_unresponsive() {
                    warn!(error = %e, "device did not answer temperature poll");
                } else {
                    warn!(error = %e, "temperature poll failed");
                }
                return;
            }
        }

        let free_text = Self::record_sample(&mut inner).await;

        let within = (inner.set_point - inner.current_temperature).abs() <= self.settings.accuracy;
        if inner.busy && within {
            inner.in_tolerance += 1;
        } else {
            inner.in_tolerance = 0;
        }
        debug!(
            temperature = inner.current_temperature,
            set_point = inner.set_point,
            in_tolerance = inner.in_tolerance,
            "poll"
        );

        if inner.in_tolerance >= CONVERGENCE_COUNT {
            inner.busy = false;
            inner.in_tolerance = 0;
            info!(set_point = inner.set_point, ramp = ?inner.current_ramp, "at target temperature");
            if inner.running {
                self.ramp_converged(&mut inner).await;
            } else if inner.poller.is_some() {
                self.reschedule_poller(&mut inner, self.settings.idle_poll, true);
            }
        }

        self.emit(&inner, free_text);
    }

    /// Dwell elapsed: advance to the next ramp, or stop past the end.
    pub async fn hold_timer_fired(&self) {
        let generation = self.inner.lock().await.generation;
        self.on_hold_timer(generation).await;
    }

    /// Emit a hardware-driven status event carrying `free_text`.
    pub async fn notify_status(&self, free_text: impl Into<String>) {
        let inner = self.inner.lock().await;
        self.emit(&inner, free_text.into());
    }

    // ------------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------------

    /// Begin polling at the rate that matches the current state.
    pub async fn start_poller(&self) {
        let mut inner = self.inner.lock().await;
        let period = if inner.busy {
            self.settings.busy_poll
        } else {
            self.settings.idle_poll
        };
        self.reschedule_poller(&mut inner, period, true);
    }

    /// Cancel polling entirely.
    pub async fn stop_poller(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.poller.take() {
            self.scheduler.cancel(handle);
            debug!("poller stopped");
        }
    }

    /// Change the poll period.
    ///
    /// With `grace` the delay remaining until the next tick is preserved (capped at the new
    /// period); without it the next tick is a full `period` away.
    pub async fn set_poll_period(&self, period: Duration, grace: bool) {
        let mut inner = self.inner.lock().await;
        self.reschedule_poller(&mut inner, period, grace);
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Derived state, see [`ControllerState`].
    pub async fn state(&self) -> ControllerState {
        self.inner.lock().await.state()
    }

    /// Latest status without emitting it.
    pub async fn status(&self) -> TemperatureStatus {
        let inner = self.inner.lock().await;
        inner.status(inner.default_free_text())
    }

    /// Copy of every state variable, taken under one lock.
    pub async fn snapshot(&self) -> ControllerSnapshot {
        let inner = self.inner.lock().await;
        ControllerSnapshot {
            state: inner.state(),
            running: inner.running,
            busy: inner.busy,
            current_ramp: inner.current_ramp,
            target_temperature: inner.target_temperature,
            set_point: inner.set_point,
            current_temperature: inner.current_temperature,
            in_tolerance_count: inner.in_tolerance,
            hold_timer_pending: inner.hold_timer.is_some(),
            poll_period: inner.poller.map(|_| inner.poll_period),
        }
    }

    /// Whether a ramp program is active.
    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.running
    }

    /// Whether the device is still moving toward its target.
    pub async fn is_busy(&self) -> bool {
        self.inner.lock().await.busy
    }

    /// Index of the ramp being executed, `None` outside a program run.
    pub async fn current_ramp_index(&self) -> Option<usize> {
        self.inner.lock().await.current_ramp
    }

    /// Samples recorded since the run started.
    pub async fn buffered_samples(&self) -> Vec<Sample> {
        self.inner.lock().await.samples.clone()
    }

    /// Drain the sample buffer.
    pub async fn take_samples(&self) -> Vec<Sample> {
        std::mem::take(&mut self.inner.lock().await.samples)
    }

    fn check_limits(&self, target: f64) -> AppResult<()> {
        let settings = &self.settings;
        if (settings.lower_temp..=settings.upper_temp).contains(&target) {
            Ok(())
        } else {
            Err(ThermoError::OutOfRange {
                value: target,
                lower: settings.lower_temp,
                upper: settings.upper_temp,
            })
        }
    }

    // ------------------------------------------------------------------------
    // Internals (caller holds the state lock)
    // ------------------------------------------------------------------------

    async fn stop_locked(&self, inner: &mut ControllerInner) -> AppResult<()> {
        if let Some(handle) = inner.hold_timer.take() {
            self.scheduler.cancel(handle);
        }
        inner.generation += 1;
        inner.running = false;
        inner.current_ramp = None;
        inner.busy = false;
        inner.in_tolerance = 0;
        inner.dispatch_pending = false;
        inner.started_at = None;
        if inner.poller.is_some() {
            self.reschedule_poller(inner, self.settings.idle_poll, true);
        }
        if inner.sink_open {
            inner.sink_open = false;
            if let Some(sink) = inner.sink.as_mut() {
                if let Err(e) = sink.close().await {
                    warn!(error = %e, "failed to close data sink");
                }
            }
        }

        let result = self.hardware.halt().await;
        match &result {
            Ok(()) => info!("controller stopped"),
            Err(e) => warn!(error = %e, "halt failed; controller state reset anyway"),
        }
        result
    }

    async fn on_hold_timer(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            debug!("ignoring hold timer from a previous run");
            return;
        }
        if let Some(handle) = inner.hold_timer.take() {
            self.scheduler.cancel(handle);
        }
        if !inner.running {
            return;
        }
        self.advance(&mut inner).await;
        self.emit(&inner, inner.default_free_text());
    }

    async fn ramp_converged(&self, inner: &mut ControllerInner) {
        let Some(index) = inner.current_ramp else {
            return;
        };
        let dwell = inner
            .program
            .get(index)
            .and_then(RampDescriptor::dwell_duration);
        match dwell {
            Some(dwell) => {
                let callback = self.hold_callback(inner.generation);
                inner.hold_timer = Some(self.scheduler.schedule_once(callback, dwell));
                info!(ramp = index, dwell_s = dwell.as_secs_f64(), "holding at ramp end");
            }
            None => self.advance(inner).await,
        }
    }

    async fn advance(&self, inner: &mut ControllerInner) {
        let next = inner.current_ramp.map_or(0, |index| index + 1);
        if next >= inner.program.len() {
            info!(ramps = inner.program.len(), "ramp program complete");
            if let Err(e) = self.stop_locked(inner).await {
                warn!(error = %e, "stop after final ramp failed");
            }
            return;
        }
        inner.current_ramp = Some(next);
        self.dispatch_current(inner).await;
    }

    /// Send the current ramp and start motion. Failure leaves the ramp pending for the next poll.
    async fn dispatch_current(&self, inner: &mut ControllerInner) -> bool {
        let Some(index) = inner.current_ramp else {
            return false;
        };
        let Some(ramp) = inner.program.get(index).copied() else {
            return false;
        };

        let result = match self.hardware.send_ramp(index, &ramp).await {
            Ok(()) => self.hardware.start_motion().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                inner.target_temperature = ramp.end;
                inner.set_point = ramp.end;
                inner.busy = true;
                inner.in_tolerance = 0;
                inner.dispatch_pending = false;
                info!(ramp = index, end = ramp.end, rate = ramp.rate, "ramp started");
                true
            }
            Err(e) => {
                inner.busy = false;
                inner.dispatch_pending = true;
                warn!(ramp = index, error = %e, "failed to start ramp; retrying on next poll");
                false
            }
        }
    }

    async fn begin_run(inner: &mut ControllerInner) {
        inner.started_at = Some(Instant::now());
        inner.samples.clear();
        if !inner.sink_open {
            Self::open_sink(inner).await;
        }
    }

    async fn open_sink(inner: &mut ControllerInner) {
        if let Some(sink) = inner.sink.as_mut() {
            match sink.open().await {
                Ok(()) => inner.sink_open = true,
                Err(e) => warn!(error = %e, "failed to open data sink"),
            }
        }
    }

    /// Buffer the latest reading if a run is active and return the status free text.
    async fn record_sample(inner: &mut ControllerInner) -> String {
        let sample = Sample {
            elapsed: inner.elapsed(),
            temperature: inner.current_temperature,
        };
        let line = sample.to_line();
        if inner.started_at.is_some() {
            inner.samples.push(sample);
            if inner.sink_open {
                if let Some(sink) = inner.sink.as_mut() {
                    if let Err(e) = sink.write(&line).await {
                        warn!(error = %e, "failed to write sample");
                    }
                }
            }
        }
        line
    }

    fn reschedule_poller(&self, inner: &mut ControllerInner, period: Duration, grace: bool) {
        let now = Instant::now();
        let initial_delay = match inner.poller.take() {
            Some(handle) => {
                self.scheduler.cancel(handle);
                if grace {
                    inner.next_poll_at.saturating_duration_since(now).min(period)
                } else {
                    period
                }
            }
            None => Duration::ZERO,
        };

        inner.poll_period = period;
        inner.next_poll_at = now + initial_delay;
        inner.poller = Some(
            self.scheduler
                .schedule_recurring(self.poll_callback(), initial_delay, period),
        );
        debug!(period_ms = period.as_millis() as u64, "poll period set");
    }

    fn poll_callback(&self) -> ScheduledCallback {
        let this = self.this.clone();
        Arc::new(move || {
            let this = this.clone();
            Box::pin(async move {
                if let Some(controller) = this.upgrade() {
                    controller.poll_tick().await;
                }
            })
        })
    }

    fn hold_callback(&self, generation: u64) -> ScheduledCallback {
        let this = self.this.clone();
        Arc::new(move || {
            let this = this.clone();
            Box::pin(async move {
                if let Some(controller) = this.upgrade() {
                    controller.on_hold_timer(generation).await;
                }
            })
        })
    }

    fn emit(&self, inner: &ControllerInner, free_text: String) {
        // No subscribers is not an error.
        let _ = self.status_tx.send(inner.status(free_text));
    }
}

impl<H: TemperatureHardware> Drop for InstrumentController<H> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(handle) = inner.poller.take() {
            self.scheduler.cancel(handle);
        }
        if let Some(handle) = inner.hold_timer.take() {
            self.scheduler.cancel(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{FurnaceCall, FurnaceModel, SimulatedFurnace};
    use crate::scheduler::ManualScheduler;
    use tracing_test::traced_test;

    type TestController = InstrumentController<Arc<SimulatedFurnace>>;

    fn setup(model: FurnaceModel) -> (Arc<TestController>, Arc<SimulatedFurnace>, Arc<ManualScheduler>) {
        let furnace = Arc::new(SimulatedFurnace::new(model));
        let scheduler = Arc::new(ManualScheduler::new());
        let controller = InstrumentController::new(
            Arc::clone(&furnace),
            scheduler.clone(),
            ControllerSettings::default(),
        );
        (controller, furnace, scheduler)
    }

    async fn poll(controller: &TestController, times: usize) {
        for _ in 0..times {
            controller.poll_tick().await;
        }
    }

    #[tokio::test]
    async fn test_start_requires_program() {
        let (controller, furnace, _) = setup(FurnaceModel::new(20.0));
        assert!(matches!(controller.start().await, Err(ThermoError::EmptyProgram)));
        assert!(furnace.calls().await.is_empty());
        assert!(!controller.is_running().await);
    }

    #[tokio::test]
    async fn test_target_out_of_range() {
        let (controller, furnace, _) = setup(FurnaceModel::new(20.0));
        for value in [-35.1, 200.5, f64::NAN] {
            assert!(matches!(
                controller.set_target_temperature(value).await,
                Err(ThermoError::OutOfRange { .. })
            ));
        }
        assert!(furnace.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_target_rejected_while_busy() {
        let (controller, _, _) = setup(FurnaceModel::new(20.0));
        controller.set_target_temperature(50.0).await.unwrap();
        assert!(controller.is_busy().await);
        assert_eq!(controller.state().await, ControllerState::Heating);
        assert!(matches!(
            controller.set_target_temperature(40.0).await,
            Err(ThermoError::AlreadyBusy)
        ));

        controller.stop().await.unwrap();
        controller.set_target_temperature(40.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_move_converges_after_five_polls() {
        let (controller, _, scheduler) = setup(FurnaceModel::new(20.0).with_step(10.0));
        controller.set_target_temperature(40.0).await.unwrap();
        assert_eq!(
            scheduler.recurring()[0].period,
            Some(Duration::from_secs(1))
        );

        // 30, 40 (1st in tolerance), then four more.
        poll(&controller, 5).await;
        assert!(controller.is_busy().await);
        poll(&controller, 1).await;
        assert!(!controller.is_busy().await);
        assert_eq!(controller.state().await, ControllerState::Idle);
        assert_eq!(
            scheduler.recurring()[0].period,
            Some(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn test_noisy_readings_never_converge() {
        // Readings alternate 40.15 / 39.85 around 40.0 with accuracy 0.1.
        let (controller, _, _) = setup(
            FurnaceModel::new(40.0).with_step(10.0).with_noise(0.15),
        );
        controller.set_target_temperature(40.0).await.unwrap();
        poll(&controller, 20).await;
        assert!(controller.is_busy().await);
        assert_eq!(controller.snapshot().await.in_tolerance_count, 0);
    }

    #[tokio::test]
    async fn test_cooling_label() {
        let (controller, _, _) = setup(FurnaceModel::new(20.0));
        controller.set_target_temperature(-10.0).await.unwrap();
        controller.poll_tick().await;
        assert_eq!(controller.state().await, ControllerState::Cooling);
    }

    #[tokio::test]
    async fn test_read_failure_is_a_single_failed_step() {
        let (controller, furnace, _) = setup(FurnaceModel::new(20.0).with_step(20.0));
        controller.set_target_temperature(40.0).await.unwrap();
        poll(&controller, 3).await;
        assert_eq!(controller.snapshot().await.in_tolerance_count, 3);

        furnace.fail_next_reads(1);
        controller.poll_tick().await;
        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.in_tolerance_count, 0);
        assert!(snapshot.busy);

        poll(&controller, 5).await;
        assert!(!controller.is_busy().await);
    }

    #[tokio::test]
    async fn test_failed_start_leaves_controller_idle() {
        let (controller, furnace, scheduler) = setup(FurnaceModel::new(20.0));
        controller
            .add_ramp(RampDescriptor::new(20.0, 50.0, 10.0, 0.0))
            .await
            .unwrap();
        furnace.fail_next_dispatches(1);

        assert!(matches!(controller.start().await, Err(ThermoError::Hardware(_))));
        let snapshot = controller.snapshot().await;
        assert!(!snapshot.running);
        assert_eq!(snapshot.current_ramp, None);
        assert!(scheduler.pending().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_dispatch_retried_on_next_poll() {
        let (controller, furnace, _) = setup(FurnaceModel::new(20.0).with_step(50.0));
        controller
            .set_ramps(RampProgram::new(vec![
                RampDescriptor::new(20.0, 50.0, 10.0, 0.0),
                RampDescriptor::new(50.0, 30.0, 10.0, 0.0),
            ]))
            .await
            .unwrap();
        controller.start().await.unwrap();

        poll(&controller, 4).await;
        furnace.fail_next_dispatches(1);
        poll(&controller, 1).await;

        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.current_ramp, Some(1));
        assert!(snapshot.running);
        assert!(!snapshot.busy);
        assert_eq!(snapshot.state, ControllerState::HoldingAtLimit);
        assert!(logs_contain("retrying on next poll"));

        poll(&controller, 1).await;
        let snapshot = controller.snapshot().await;
        assert!(snapshot.busy);
        assert_eq!(snapshot.set_point, 30.0);
        assert!(furnace
            .calls()
            .await
            .contains(&FurnaceCall::SendRamp { index: 1, end: 30.0, rate: 10.0 }));
    }

    #[tokio::test]
    async fn test_set_ramps_idle_replaces_everything() {
        let (controller, _, _) = setup(FurnaceModel::new(20.0));
        controller
            .add_ramp(RampDescriptor::new(20.0, 50.0, 10.0, 0.0))
            .await
            .unwrap();
        controller
            .set_ramps(RampProgram::new(vec![RampDescriptor::new(0.0, 1.0, 1.0, 0.0)]))
            .await
            .unwrap();
        assert_eq!(controller.ramps().await.ramps()[0].end, 1.0);

        controller.clear_ramps().await;
        assert!(controller.ramps().await.is_empty());
        assert!(controller
            .add_ramp(RampDescriptor::new(0.0, 1.0, 0.0, 0.0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ramps_outside_limits_rejected() {
        let (controller, furnace, _) = setup(FurnaceModel::new(20.0));
        assert!(matches!(
            controller.add_ramp(RampDescriptor::new(20.0, 250.0, 10.0, 0.0)).await,
            Err(ThermoError::OutOfRange { value, .. }) if value == 250.0
        ));
        assert!(controller.ramps().await.is_empty());

        controller
            .add_ramp(RampDescriptor::new(20.0, 50.0, 10.0, 0.0))
            .await
            .unwrap();
        let revised = RampProgram::new(vec![
            RampDescriptor::new(20.0, 40.0, 10.0, 0.0),
            RampDescriptor::new(40.0, -40.0, 10.0, 0.0),
        ]);
        assert!(matches!(
            controller.set_ramps(revised).await,
            Err(ThermoError::OutOfRange { value, .. }) if value == -40.0
        ));
        assert_eq!(controller.ramps().await.ramps()[0].end, 50.0);
        assert_eq!(controller.ramps().await.len(), 1);
        assert!(furnace.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_unrepresentable_dwell_rejected_before_dispatch() {
        let (controller, furnace, _) = setup(FurnaceModel::new(20.0));
        assert!(matches!(
            controller.add_ramp(RampDescriptor::new(20.0, 50.0, 10.0, 1e18)).await,
            Err(ThermoError::Configuration(_))
        ));
        assert!(controller.ramps().await.is_empty());
        assert!(matches!(controller.start().await, Err(ThermoError::EmptyProgram)));
        assert!(furnace.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_cancels_hold_timer() {
        let (controller, furnace, scheduler) = setup(FurnaceModel::new(20.0).with_step(50.0));
        controller
            .add_ramp(RampDescriptor::new(20.0, 30.0, 10.0, 1.0))
            .await
            .unwrap();
        controller.start().await.unwrap();
        poll(&controller, 5).await;
        assert_eq!(controller.state().await, ControllerState::HoldingForTime);
        let hold = scheduler.one_shots()[0];
        assert_eq!(hold.delay, Duration::from_secs(60));

        controller.stop().await.unwrap();
        assert!(scheduler.one_shots().is_empty());
        assert!(!scheduler.fire(hold.handle).await);
        assert_eq!(furnace.calls().await.last(), Some(&FurnaceCall::Halt));
        assert_eq!(controller.state().await, ControllerState::Idle);
    }

    #[tokio::test]
    async fn test_samples_and_status_events() {
        let (controller, _, _) = setup(FurnaceModel::new(20.0).with_step(10.0));
        let mut events = controller.subscribe();

        controller.poll_tick().await;
        assert!(controller.buffered_samples().await.is_empty());
        let idle = events.recv().await.unwrap();
        assert_eq!(idle.state_label(), "Idle");
        assert_eq!(idle.free_text_sample, "0.00 20");

        controller.set_target_temperature(40.0).await.unwrap();
        let _ = events.recv().await.unwrap();
        poll(&controller, 2).await;
        let status = events.recv().await.unwrap();
        assert_eq!(status.current_temperature, 30.0);
        assert_eq!(status.current_ramp_index, None);
        assert_eq!(controller.take_samples().await.len(), 2);
        assert!(controller.buffered_samples().await.is_empty());

        controller.notify_status("Run: Program 1 Segment 2").await;
        let _ = events.recv().await.unwrap();
        let custom = events.recv().await.unwrap();
        assert_eq!(custom.free_text_sample, "Run: Program 1 Segment 2");
    }

    #[tokio::test]
    async fn test_poller_lifecycle_and_grace() {
        let (controller, _, scheduler) = setup(FurnaceModel::new(20.0));
        controller.start_poller().await;
        let first = scheduler.recurring();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delay, Duration::ZERO);
        assert_eq!(first[0].period, Some(Duration::from_secs(5)));

        controller
            .set_poll_period(Duration::from_secs(2), false)
            .await;
        let second = scheduler.recurring();
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].handle, first[0].handle);
        assert_eq!(second[0].delay, Duration::from_secs(2));

        controller
            .set_poll_period(Duration::from_secs(1), true)
            .await;
        assert!(scheduler.recurring()[0].delay <= Duration::from_secs(1));

        controller.stop_poller().await;
        assert!(scheduler.recurring().is_empty());
    }

    #[tokio::test]
    async fn test_sink_receives_lines_during_run() {
        use crate::data::MemorySink;

        let (controller, _, _) = setup(FurnaceModel::new(20.0).with_step(10.0));
        let sink = MemorySink::new();
        controller.attach_sink(Box::new(sink.clone())).await;

        controller.poll_tick().await;
        controller.set_target_temperature(30.0).await.unwrap();
        poll(&controller, 2).await;
        controller.stop().await.unwrap();
        controller.poll_tick().await;

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with(" 30"));
    }
}
