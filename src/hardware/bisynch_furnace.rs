//! Furnace controller driven over the framed bisynch protocol.
//!
//! Parameter mnemonics default to the common controller set (`PV` process value, `SL` setpoint,
//! `RR` ramp rate, `PS` program status) and can be overridden per installation.

use crate::controller::TemperatureHardware;
use crate::error::AppResult;
use crate::protocol::BisynchClient;
use crate::ramp::RampDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Program status value that starts motion.
pub const STATUS_RUN: f64 = 2.0;
/// Program status value that holds the current setpoint.
pub const STATUS_HOLD: f64 = 4.0;

/// Mnemonics used for each hardware hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BisynchMnemonics {
    /// Measured temperature
    pub process_value: String,
    /// Working setpoint
    pub setpoint: String,
    /// Ramp rate in degrees per minute
    pub ramp_rate: String,
    /// Run/hold control
    pub program_status: String,
}

impl Default for BisynchMnemonics {
    fn default() -> Self {
        Self {
            process_value: "PV".to_string(),
            setpoint: "SL".to_string(),
            ramp_rate: "RR".to_string(),
            program_status: "PS".to_string(),
        }
    }
}

/// [`TemperatureHardware`] over a [`BisynchClient`].
pub struct BisynchFurnace {
    client: BisynchClient,
    mnemonics: BisynchMnemonics,
}

impl BisynchFurnace {
    /// Furnace using the default mnemonics.
    pub fn new(client: BisynchClient) -> Self {
        Self::with_mnemonics(client, BisynchMnemonics::default())
    }

    /// Furnace using installation-specific mnemonics.
    pub fn with_mnemonics(client: BisynchClient, mnemonics: BisynchMnemonics) -> Self {
        Self { client, mnemonics }
    }

    /// Underlying protocol client.
    pub fn client(&self) -> &BisynchClient {
        &self.client
    }

    /// Current setpoint as reported by the device.
    pub async fn read_setpoint(&self) -> AppResult<f64> {
        self.client.query_f64(&self.mnemonics.setpoint).await
    }
}

#[async_trait]
impl TemperatureHardware for BisynchFurnace {
    async fn send_ramp(&self, index: usize, ramp: &RampDescriptor) -> AppResult<()> {
        self.client.set(&self.mnemonics.ramp_rate, ramp.rate).await?;
        self.client.set(&self.mnemonics.setpoint, ramp.end).await?;
        info!(ramp = index, end = ramp.end, rate = ramp.rate, "ramp sent to controller");
        Ok(())
    }

    async fn start_motion(&self) -> AppResult<()> {
        self.client
            .set(&self.mnemonics.program_status, STATUS_RUN)
            .await
    }

    async fn move_to_target(&self, target: f64) -> AppResult<()> {
        self.client.set(&self.mnemonics.setpoint, target).await?;
        self.start_motion().await
    }

    async fn halt(&self) -> AppResult<()> {
        self.client
            .set(&self.mnemonics.program_status, STATUS_HOLD)
            .await
    }

    async fn read_current_temperature(&self) -> AppResult<f64> {
        self.client.query_f64(&self.mnemonics.process_value).await
    }
}
