//! Shipped configuration and ramp program files.

use rust_thermo::config::ThermoConfig;
use rust_thermo::link::Parity;
use rust_thermo::ramp::RampProgram;
use std::io::Write;
use std::time::Duration;

#[test]
fn test_shipped_config_loads() {
    let config = ThermoConfig::load_from("config/rust_thermo.toml").unwrap();
    assert_eq!(config.application.name, "rust_thermo");
    assert_eq!(config.link.data_bits, 7);
    assert_eq!(config.link.parity, Parity::Even);
    assert_eq!(config.reply_timeout(), Duration::from_secs(2));
    assert_eq!(config.bisynch_address().to_wire(), "0000");

    let settings = config.controller_settings();
    assert_eq!(settings.busy_poll, Duration::from_secs(1));
    assert_eq!(settings.idle_poll, Duration::from_secs(5));
    assert!(config.storage.data_dir.is_none());
}

#[test]
fn test_config_file_with_invalid_address_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[application]
name = "bad"

[link]
port = "/dev/null"

[bisynch]
group_id = 12
"#
    )
    .unwrap();
    assert!(ThermoConfig::load_from(file.path()).is_err());
}

#[test]
fn test_missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ThermoConfig::load_from(dir.path().join("absent.toml")).is_err());
}

#[test]
fn test_demo_program_loads() {
    let program = RampProgram::load_toml("demos/two_ramps.toml").unwrap();
    assert_eq!(program.len(), 2);
    assert_eq!(program.ramps()[0].dwell, 0.0);
    assert_eq!(
        program.ramps()[1].dwell_duration(),
        Some(Duration::from_secs(120))
    );
}
