//! Tracing initialisation.
//!
//! `RUST_LOG` always wins; the configured level is only the fallback directive.
//!
//! ```bash
//! RUST_LOG=rust_thermo::link=trace rust_thermo simulate --ramp 50:10:0
//! ```

use crate::config::ThermoConfig;
use crate::error::{AppResult, ThermoError};
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to `level`.
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init(level: &str) -> AppResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| ThermoError::Configuration(format!("invalid log level '{level}': {e}")))?,
    };

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

/// Initialise tracing from the `application.log_level` setting.
pub fn init_from_config(config: &ThermoConfig) -> AppResult<()> {
    init(&config.application.log_level)
}
