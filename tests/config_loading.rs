//! Loading the configuration file and environment overrides.

use std::io::Write;
use std::path::PathBuf;

use cockpit::config::CockpitConfig;
use cockpit::core::{ExposureMode, TimeMs};
use cockpit::driver_mock::MockMode;
use cockpit::executor::Encoding;
use cockpit::tracing_init::OutputFormat;
use serial_test::serial;
use tempfile::NamedTempFile;

const MINIMAL: &str = r#"
[application]
name = "bench"
log_level = "debug"

[storage]
output_dir = "out"

[rig.executor]
name = "dsp"
encoding = { type = "legacy_ticks" }

[[rig.cameras]]
name = "cam"
exposure_mode = "trigger_after"
trigger_line = 3
readout_time = "2.25"
"#;

fn write(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn shipped_config_is_valid() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/cockpit.toml");
    let config = CockpitConfig::load_from(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.rig.cameras.len(), 1);
    assert_eq!(config.rig.lights.len(), 2);
    assert_eq!(config.rig.cameras[0].readout_time, TimeMs::parse("12.5").unwrap());
    assert_eq!(config.rig.delegated[0].trigger_time, TimeMs::from_us(100));
    assert_eq!(config.application.log_format, OutputFormat::Pretty);
}

#[test]
#[serial]
fn defaults_fill_the_gaps() {
    let file = write(MINIMAL);
    let config = CockpitConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.application.log_format, OutputFormat::Pretty);
    assert_eq!(config.experiment.executor_timeout_ms, None);
    assert_eq!(config.experiment.post_run_grace_ms, 1000);
    assert_eq!(config.experiment.saver_idle_ms, 500);
    assert_eq!(config.storage.max_filesize_mb, None);
    assert_eq!(config.rig.mode, MockMode::Instant);
    assert_eq!(
        config.rig.executor.encoding,
        Encoding::LegacyTicks { ticks_per_ms: 10 }
    );
    assert!(config.rig.z_stage.is_none());

    let camera = &config.rig.cameras[0];
    assert_eq!(camera.exposure_mode, ExposureMode::TriggerAfter);
    assert_eq!(camera.readout_time, TimeMs::from_us(2250));
}

#[test]
#[serial]
fn environment_overrides_the_file() {
    let file = write(MINIMAL);
    std::env::set_var("COCKPIT_APPLICATION__LOG_LEVEL", "warn");
    std::env::set_var("COCKPIT_EXPERIMENT__EXECUTOR_TIMEOUT_MS", "2000");
    let loaded = CockpitConfig::load_from(file.path());
    std::env::remove_var("COCKPIT_APPLICATION__LOG_LEVEL");
    std::env::remove_var("COCKPIT_EXPERIMENT__EXECUTOR_TIMEOUT_MS");

    let config = loaded.unwrap();
    assert_eq!(config.application.log_level, "warn");
    assert_eq!(config.experiment.executor_timeout_ms, Some(2000));
    assert_eq!(
        config.execution_settings().executor_timeout,
        Some(std::time::Duration::from_secs(2))
    );
}

#[test]
#[serial]
fn inexact_timing_is_rejected() {
    // A tenth of a picosecond is off the grid.
    let file = write(&MINIMAL.replace(r#"readout_time = "2.25""#, "readout_time = 1e-10"));
    let err = CockpitConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().contains("Inexact time value"));
}

#[test]
#[serial]
fn missing_sections_fail_to_load() {
    let file = write("[application]\nname = \"x\"\nlog_level = \"info\"\n");
    assert!(CockpitConfig::load_from(file.path()).is_err());
}
