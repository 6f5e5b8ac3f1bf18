//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/rust_thermo.toml` (base configuration)
//! 2. Environment variables (prefixed with `RUSTTHERMO_`, nested keys separated by `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! RUSTTHERMO_APPLICATION__LOG_LEVEL=debug
//! RUSTTHERMO_LINK__PORT=/dev/ttyUSB1
//! RUSTTHERMO_CONTROLLER__ACCURACY=0.25
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_thermo::config::ThermoConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ThermoConfig::load()?;
//!     println!("Link: {} @ {} baud", config.link.port, config.link.baud_rate);
//!     Ok(())
//! }
//! ```

use crate::controller::ControllerSettings;
use crate::link::{Parity, SerialLinkConfig};
use crate::protocol::bisynch::BisynchAddress;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Sources could not be read or merged
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values loaded but failed validation
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for crate::error::ThermoError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::LoadError(e) => crate::error::ThermoError::Config(e),
            ConfigError::ValidationError(msg) => crate::error::ThermoError::Configuration(msg),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermoConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link settings
    pub link: LinkConfig,
    /// Ramp controller settings
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Framed protocol addressing
    #[serde(default)]
    pub bisynch: BisynchConfig,
    /// Data logging settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Serial port (e.g., "/dev/ttyUSB0")
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (7 or 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Parity (none, even, odd)
    #[serde(default)]
    pub parity: Parity,
    /// Reply timeout in milliseconds
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
    /// Terminator that ends a reply
    #[serde(default = "default_terminator")]
    pub reply_terminator: String,
    /// Terminator appended to every command
    #[serde(default = "default_terminator")]
    pub command_terminator: String,
    /// Maximum reply length before the buffer is declared overflowed
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

/// Ramp controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Lowest temperature the device may be driven to
    #[serde(default = "default_lower_temp")]
    pub lower_temp: f64,
    /// Highest temperature the device may be driven to
    #[serde(default = "default_upper_temp")]
    pub upper_temp: f64,
    /// Convergence tolerance in degrees
    #[serde(default = "default_accuracy")]
    pub accuracy: f64,
    /// Poll period while idle, in milliseconds
    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,
    /// Poll period while moving, in milliseconds
    #[serde(default = "default_busy_poll")]
    pub busy_poll_ms: u64,
}

/// Framed protocol addressing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BisynchConfig {
    /// Group identifier (0-9)
    #[serde(default)]
    pub group_id: u8,
    /// Unit identifier (0-9)
    #[serde(default)]
    pub unit_id: u8,
}

/// Data logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for per-run CSV files; logging is disabled when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            lower_temp: default_lower_temp(),
            upper_temp: default_upper_temp(),
            accuracy: default_accuracy(),
            idle_poll_ms: default_idle_poll(),
            busy_poll_ms: default_busy_poll(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_reply_timeout() -> u64 {
    10_000
}

fn default_terminator() -> String {
    "\r".to_string()
}

fn default_buffer_capacity() -> usize {
    1024
}

fn default_lower_temp() -> f64 {
    -35.0
}

fn default_upper_temp() -> f64 {
    200.0
}

fn default_accuracy() -> f64 {
    0.1
}

fn default_idle_poll() -> u64 {
    5000
}

fn default_busy_poll() -> u64 {
    1000
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ThermoConfig {
    /// Load configuration from `config/rust_thermo.toml` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/rust_thermo.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables take precedence over the file. The result is validated before it
    /// is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUSTTHERMO_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::string(text))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Serial framing parameters are representable
    /// - Temperature limits are ordered and the tolerance is positive
    /// - Poll periods and reply timeout are non-zero
    /// - Framed protocol IDs are single digits
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.link.port.is_empty() {
            return Err(ConfigError::ValidationError(
                "link: 'port' cannot be empty".to_string(),
            ));
        }
        if !matches!(self.link.data_bits, 7 | 8) {
            return Err(ConfigError::ValidationError(format!(
                "link: data_bits {} must be 7 or 8",
                self.link.data_bits
            )));
        }
        if !matches!(self.link.stop_bits, 1 | 2) {
            return Err(ConfigError::ValidationError(format!(
                "link: stop_bits {} must be 1 or 2",
                self.link.stop_bits
            )));
        }
        if self.link.reply_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "link: reply_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.link.buffer_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "link: buffer_capacity must be > 0".to_string(),
            ));
        }

        let controller = &self.controller;
        if controller.lower_temp >= controller.upper_temp {
            return Err(ConfigError::ValidationError(format!(
                "controller: lower_temp {} must be below upper_temp {}",
                controller.lower_temp, controller.upper_temp
            )));
        }
        if controller.accuracy <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "controller: accuracy {} must be > 0",
                controller.accuracy
            )));
        }
        if controller.idle_poll_ms == 0 || controller.busy_poll_ms == 0 {
            return Err(ConfigError::ValidationError(
                "controller: poll periods must be > 0".to_string(),
            ));
        }

        if self.bisynch.group_id > 9 || self.bisynch.unit_id > 9 {
            return Err(ConfigError::ValidationError(format!(
                "bisynch: group_id {} and unit_id {} must be 0-9",
                self.bisynch.group_id, self.bisynch.unit_id
            )));
        }

        Ok(())
    }

    /// Serial port parameters for [`crate::link::open_serial`]
    pub fn serial_link(&self) -> SerialLinkConfig {
        SerialLinkConfig {
            path: self.link.port.clone(),
            baud_rate: self.link.baud_rate,
            data_bits: self.link.data_bits,
            stop_bits: self.link.stop_bits,
            parity: self.link.parity,
            ..Default::default()
        }
    }

    /// Reply timeout as a duration
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.link.reply_timeout_ms)
    }

    /// Controller settings derived from the `controller` section
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            lower_temp: self.controller.lower_temp,
            upper_temp: self.controller.upper_temp,
            accuracy: self.controller.accuracy,
            idle_poll: Duration::from_millis(self.controller.idle_poll_ms),
            busy_poll: Duration::from_millis(self.controller.busy_poll_ms),
        }
    }

    /// Framed protocol address derived from the `bisynch` section
    pub fn bisynch_address(&self) -> BisynchAddress {
        BisynchAddress {
            group_id: self.bisynch.group_id,
            unit_id: self.bisynch.unit_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ThermoConfig {
        ThermoConfig {
            application: ApplicationConfig {
                name: "Test furnace".to_string(),
                log_level: "info".to_string(),
            },
            link: LinkConfig {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 9600,
                data_bits: 7,
                stop_bits: 1,
                parity: Parity::Even,
                reply_timeout_ms: 10_000,
                reply_terminator: "\r".to_string(),
                command_terminator: "\r".to_string(),
                buffer_capacity: 1024,
            },
            controller: ControllerConfig::default(),
            bisynch: BisynchConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = valid_config();
        config.application.log_level = "invalid".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_inverted_temperature_limits() {
        let mut config = valid_config();
        config.controller.lower_temp = 300.0;

        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("must be below upper_temp"));
    }

    #[test]
    fn test_bisynch_ids_must_be_single_digits() {
        let mut config = valid_config();
        config.bisynch.unit_id = 12;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_data_bits() {
        let mut config = valid_config();
        config.link.data_bits = 5;

        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("data_bits"));
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = ThermoConfig::from_toml_str(
            r#"
            [application]
            name = "Minimal"

            [link]
            port = "/dev/ttyS0"
            "#,
        )
        .unwrap();

        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.link.reply_timeout_ms, 10_000);
        assert_eq!(config.link.reply_terminator, "\r");
        assert_eq!(config.link.parity, Parity::None);
        assert_eq!(config.controller.accuracy, 0.1);
        assert_eq!(config.bisynch_address().to_wire(), "0000");
        assert_eq!(config.reply_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_controller_settings_conversion() {
        let settings = valid_config().controller_settings();
        assert_eq!(settings.lower_temp, -35.0);
        assert_eq!(settings.upper_temp, 200.0);
        assert_eq!(settings.busy_poll, Duration::from_secs(1));
        assert_eq!(settings.idle_poll, Duration::from_secs(5));
    }
}
