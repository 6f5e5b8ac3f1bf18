//! Timing-frame profile text format.
//!
//! One frame group per line, values positional and comma separated:
//!
//! ```text
//! <Profile>
//! <Frames>10,0.5,ms,100,ms,0,0,1</Frames>
//! </Profile>
//! ```
//!
//! Field order: count, wait time, wait unit, run time, run unit, pause bits, wait pulse bits,
//! run pulse bits. Commas are never escaped, so free-text fields are sanitised on write.

use crate::error::{AppResult, ThermoError};
use serde::{Deserialize, Serialize};
use std::path::Path;

const PROFILE_START: &str = "<Profile>";
const PROFILE_END: &str = "</Profile>";
const FRAMES_START: &str = "<Frames>";
const FRAMES_END: &str = "</Frames>";
const FIELD_COUNT: usize = 8;

/// One group of identical timing frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameGroup {
    /// Frames in the group
    pub count: u32,
    pub wait_time: f64,
    /// Unit of `wait_time`, e.g. `ms`
    pub wait_unit: String,
    pub run_time: f64,
    /// Unit of `run_time`
    pub run_unit: String,
    /// Pause bit mask
    pub pause_bits: u32,
    /// Wait pulse bit mask
    pub wait_pulse_bits: u32,
    /// Run pulse bit mask
    pub run_pulse_bits: u32,
}

/// Ordered frame groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Groups in execution order
    pub groups: Vec<FrameGroup>,
}

/// Strip characters that would break the line format.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '"' | '\'' | '\\' | ','))
        .collect()
}

impl FrameGroup {
    fn to_line(&self) -> String {
        format!(
            "{FRAMES_START}{},{},{},{},{},{},{},{}{FRAMES_END}",
            self.count,
            self.wait_time,
            sanitize(&self.wait_unit),
            self.run_time,
            sanitize(&self.run_unit),
            self.pause_bits,
            self.wait_pulse_bits,
            self.run_pulse_bits
        )
    }

    fn parse_line(line_no: usize, body: &str) -> AppResult<Self> {
        let fields: Vec<&str> = body.split(',').map(str::trim).collect();
        if fields.len() != FIELD_COUNT {
            return Err(ThermoError::Profile(format!(
                "line {line_no}: expected {FIELD_COUNT} fields, found {}",
                fields.len()
            )));
        }

        fn number<T: std::str::FromStr>(line_no: usize, name: &str, text: &str) -> AppResult<T> {
            text.parse().map_err(|_| {
                ThermoError::Profile(format!("line {line_no}: {name} {text:?} is not a number"))
            })
        }

        Ok(Self {
            count: number(line_no, "count", fields[0])?,
            wait_time: number(line_no, "wait time", fields[1])?,
            wait_unit: fields[2].to_string(),
            run_time: number(line_no, "run time", fields[3])?,
            run_unit: fields[4].to_string(),
            pause_bits: number(line_no, "pause bits", fields[5])?,
            wait_pulse_bits: number(line_no, "wait pulse bits", fields[6])?,
            run_pulse_bits: number(line_no, "run pulse bits", fields[7])?,
        })
    }
}

impl Profile {
    /// Profile from groups in order.
    pub fn new(groups: Vec<FrameGroup>) -> Self {
        Self { groups }
    }

    /// Render the profile, one group per line.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        text.push_str(PROFILE_START);
        text.push('\n');
        for group in &self.groups {
            text.push_str(&group.to_line());
            text.push('\n');
        }
        text.push_str(PROFILE_END);
        text.push('\n');
        text
    }

    /// Parse profile text. Everything after `</Profile>` is ignored.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut groups = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line == PROFILE_START {
                continue;
            }
            if line == PROFILE_END {
                return Ok(Self { groups });
            }
            let body = line
                .strip_prefix(FRAMES_START)
                .and_then(|rest| rest.strip_suffix(FRAMES_END))
                .ok_or_else(|| {
                    ThermoError::Profile(format!("line {line_no}: unexpected {line:?}"))
                })?;
            groups.push(FrameGroup::parse_line(line_no, body)?);
        }
        Err(ThermoError::Profile(format!("missing {PROFILE_END}")))
    }

    /// Write the profile text to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        std::fs::write(path.as_ref(), self.to_text())?;
        Ok(())
    }

    /// Read and parse the profile at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::parse(&std::fs::read_to_string(path.as_ref())?)
    }
}
