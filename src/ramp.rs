//! Ramp descriptors and ordered ramp programs.
//!
//! Programs persist as TOML with one `[[ramp]]` table per step:
//!
//! ```toml
//! [[ramp]]
//! start = 20.0
//! end = 50.0
//! rate = 10.0
//! dwell = 0.0
//! ```

use crate::error::{AppResult, ThermoError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// One programmed temperature change followed by a dwell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampDescriptor {
    /// Temperature at the start of the ramp
    pub start: f64,
    /// Temperature the ramp drives to
    pub end: f64,
    /// Degrees per minute
    pub rate: f64,
    /// Minutes to hold at `end`; zero advances as soon as the device is in tolerance
    #[serde(default)]
    pub dwell: f64,
}

impl RampDescriptor {
    /// Build a ramp; call [`validate`](Self::validate) before dispatching it.
    pub fn new(start: f64, end: f64, rate: f64, dwell: f64) -> Self {
        Self {
            start,
            end,
            rate,
            dwell,
        }
    }

    /// Reject non-finite values and non-positive rates.
    ///
    /// Dwells must be non-negative and short enough to fit in a [`Duration`].
    pub fn validate(&self) -> AppResult<()> {
        if ![self.start, self.end, self.rate, self.dwell]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(ThermoError::Configuration(format!(
                "ramp {self:?} contains a non-finite value"
            )));
        }
        if self.rate <= 0.0 {
            return Err(ThermoError::Configuration(format!(
                "ramp rate {} must be > 0",
                self.rate
            )));
        }
        if self.dwell < 0.0 {
            return Err(ThermoError::Configuration(format!(
                "ramp dwell {} must be >= 0",
                self.dwell
            )));
        }
        if Duration::try_from_secs_f64(self.dwell * 60.0).is_err() {
            return Err(ThermoError::Configuration(format!(
                "ramp dwell {} minutes is too long",
                self.dwell
            )));
        }
        Ok(())
    }

    /// Dwell as a duration, `None` for a zero dwell.
    ///
    /// Dwells too long to represent saturate at [`Duration::MAX`].
    pub fn dwell_duration(&self) -> Option<Duration> {
        (self.dwell > 0.0)
            .then(|| Duration::try_from_secs_f64(self.dwell * 60.0).unwrap_or(Duration::MAX))
    }
}

/// Ordered sequence of ramps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RampProgram {
    #[serde(rename = "ramp", default)]
    ramps: Vec<RampDescriptor>,
}

impl RampProgram {
    /// Wrap ramps in program order.
    pub fn new(ramps: Vec<RampDescriptor>) -> Self {
        Self { ramps }
    }

    /// Number of ramps.
    pub fn len(&self) -> usize {
        self.ramps.len()
    }

    /// True when the program has no ramps.
    pub fn is_empty(&self) -> bool {
        self.ramps.is_empty()
    }

    /// Ramp at `index`.
    pub fn get(&self, index: usize) -> Option<&RampDescriptor> {
        self.ramps.get(index)
    }

    /// All ramps in order.
    pub fn ramps(&self) -> &[RampDescriptor] {
        &self.ramps
    }

    /// Append a ramp.
    pub fn push(&mut self, ramp: RampDescriptor) {
        self.ramps.push(ramp);
    }

    /// Remove every ramp.
    pub fn clear(&mut self) {
        self.ramps.clear();
    }

    /// Validate every ramp.
    pub fn validate(&self) -> AppResult<()> {
        self.ramps.iter().try_for_each(RampDescriptor::validate)
    }

    /// Replace every entry after `current` with the corresponding entries of `revised`.
    ///
    /// Entries `0..=current` are kept as they are. The program takes the length of `revised`
    /// but never shrinks below `current + 1`.
    pub fn replace_after(&mut self, current: usize, revised: &RampProgram) {
        let keep = (current + 1).min(self.ramps.len());
        self.ramps.truncate(keep);
        self.ramps
            .extend(revised.ramps.iter().skip(keep).copied());
    }

    /// Load a program from a TOML file.
    pub fn load_toml<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Parse a program from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let program: Self = toml::from_str(text)
            .map_err(|e| ThermoError::Configuration(format!("ramp program: {e}")))?;
        program.validate()?;
        Ok(program)
    }

    /// Write the program as TOML.
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| ThermoError::Configuration(format!("ramp program: {e}")))?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }
}

impl From<Vec<RampDescriptor>> for RampProgram {
    fn from(ramps: Vec<RampDescriptor>) -> Self {
        Self::new(ramps)
    }
}
