//! Configuration loaded with Figment.
//!
//! Sources, later ones winning:
//! 1. a TOML file (`config/cockpit.toml` by default)
//! 2. environment variables prefixed with `COCKPIT_`, nested with `__`,
//!    e.g. `COCKPIT_APPLICATION__LOG_LEVEL=debug`
//!
//! Timing fields of the rig accept integers, exact floats or decimal
//! strings in milliseconds.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cockpit_core::{CockpitError, CockpitResult};
use cockpit_driver_mock::{
    DelegatedTriggerConfig, MockCameraConfig, MockLightConfig, MockMode, MockStageConfig,
};
use cockpit_executor::{AnalogLineConfig, DigitalAnalogConfig};
use cockpit_experiment::ExecutionSettings;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::tracing_init::{parse_log_level, OutputFormat};

pub const DEFAULT_CONFIG_PATH: &str = "config/cockpit.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CockpitConfig {
    pub application: ApplicationConfig,
    #[serde(default)]
    pub experiment: ExperimentConfig,
    pub storage: StorageConfig,
    pub rig: RigConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    /// trace, debug, info, warn or error
    pub log_level: String,
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Runtime knobs for running tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Give up on an executor slice after this long. Absent waits forever.
    #[serde(default)]
    pub executor_timeout_ms: Option<u64>,
    #[serde(default = "default_post_run_grace")]
    pub post_run_grace_ms: u64,
    #[serde(default = "default_saver_idle")]
    pub saver_idle_ms: u64,
    #[serde(default = "default_pixel_size")]
    pub pixel_size_um: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory data files are written to
    pub output_dir: PathBuf,
    /// Split files larger than this many MB
    #[serde(default)]
    pub max_filesize_mb: Option<f64>,
}

/// Devices of the simulated rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigConfig {
    #[serde(default)]
    pub mode: MockMode,
    pub executor: DigitalAnalogConfig,
    #[serde(default)]
    pub cameras: Vec<MockCameraConfig>,
    #[serde(default)]
    pub lights: Vec<MockLightConfig>,
    #[serde(default)]
    pub z_stage: Option<MockStageConfig>,
    #[serde(default)]
    pub analog: Vec<AnalogLineConfig>,
    #[serde(default)]
    pub delegated: Vec<DelegatedTriggerConfig>,
    /// How many handlers finish initialising concurrently
    #[serde(default = "default_init_width")]
    pub init_width: usize,
}

fn default_post_run_grace() -> u64 {
    1000
}

fn default_saver_idle() -> u64 {
    500
}

fn default_pixel_size() -> f32 {
    0.1
}

fn default_init_width() -> usize {
    4
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            executor_timeout_ms: None,
            post_run_grace_ms: default_post_run_grace(),
            saver_idle_ms: default_saver_idle(),
            pixel_size_um: default_pixel_size(),
        }
    }
}

impl CockpitConfig {
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("COCKPIT_").split("__"))
            .extract()
    }

    /// Check what serde cannot: names, lines and limits.
    pub fn validate(&self) -> CockpitResult<()> {
        parse_log_level(&self.application.log_level).map_err(CockpitError::Configuration)?;

        let rig = &self.rig;
        rig.executor.validate()?;
        let mut names = HashSet::new();
        let all_names = std::iter::once(rig.executor.name.as_str())
            .chain(rig.cameras.iter().map(|c| c.name.as_str()))
            .chain(rig.lights.iter().map(|l| l.name.as_str()))
            .chain(rig.z_stage.iter().map(|z| z.name.as_str()))
            .chain(rig.analog.iter().map(|a| a.name.as_str()))
            .chain(rig.delegated.iter().map(|d| d.name.as_str()));
        for name in all_names {
            if !names.insert(name) {
                return Err(CockpitError::Configuration(format!(
                    "duplicate handler name '{name}'"
                )));
            }
        }

        let mut lines = HashSet::new();
        let trigger_lines = rig
            .cameras
            .iter()
            .filter_map(|c| c.trigger_line.map(|l| (c.name.as_str(), l)))
            .chain(rig.lights.iter().filter_map(|l| l.trigger_line.map(|t| (l.name.as_str(), t))))
            .chain(rig.delegated.iter().map(|d| (d.name.as_str(), d.line)));
        for (name, line) in trigger_lines {
            if line >= rig.executor.dlines {
                return Err(CockpitError::Configuration(format!(
                    "'{name}' uses digital line {line} but {} has {}",
                    rig.executor.name, rig.executor.dlines
                )));
            }
            if !lines.insert(line) {
                return Err(CockpitError::Configuration(format!(
                    "digital line {line} of '{name}' is already in use"
                )));
            }
        }

        let mut analog_lines = HashSet::new();
        for analog in &rig.analog {
            if analog.line >= rig.executor.alines || !analog_lines.insert(analog.line) {
                return Err(CockpitError::Configuration(format!(
                    "analogue line {} of '{}' is out of range or already in use",
                    analog.line, analog.name
                )));
            }
        }

        if let Some(stage) = &rig.z_stage {
            let (min, max) = stage.limits;
            if min > max {
                return Err(CockpitError::Configuration(format!(
                    "'{}' hard limits are reversed",
                    stage.name
                )));
            }
            if let Some((soft_min, soft_max)) = stage.soft_limits {
                if soft_min < min || soft_max > max || soft_min > soft_max {
                    return Err(CockpitError::LimitViolation {
                        handler: stage.name.clone(),
                        position: if soft_min < min { soft_min } else { soft_max },
                        min,
                        max,
                    });
                }
            }
        }
        Ok(())
    }

    /// Scheduler and saver settings for an experiment run.
    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            executor_timeout: self.experiment.executor_timeout_ms.map(Duration::from_millis),
            post_run_grace: Duration::from_millis(self.experiment.post_run_grace_ms),
            saver_idle: Duration::from_millis(self.experiment.saver_idle_ms),
            max_filesize_mb: self.storage.max_filesize_mb,
            pixel_size_um: self.experiment.pixel_size_um,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cockpit_core::ExposureMode;

    fn config() -> CockpitConfig {
        let mut camera = MockCameraConfig::new("cam", ExposureMode::TriggerDuration);
        camera.trigger_line = Some(0);
        let mut light = MockLightConfig::new("488", 488.0);
        light.trigger_line = Some(1);
        CockpitConfig {
            application: ApplicationConfig {
                name: "Test".to_string(),
                log_level: "info".to_string(),
                log_format: OutputFormat::Compact,
            },
            experiment: ExperimentConfig::default(),
            storage: StorageConfig {
                output_dir: PathBuf::from("data"),
                max_filesize_mb: None,
            },
            rig: RigConfig {
                mode: MockMode::Instant,
                executor: DigitalAnalogConfig::new("dsp"),
                cameras: vec![camera],
                lights: vec![light],
                z_stage: Some(MockStageConfig::new("z", 0.0, 100.0)),
                analog: vec![],
                delegated: vec![],
                init_width: 4,
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn invalid_log_level() {
        let mut config = config();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut config = config();
        config.rig.lights[0].name = "cam".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate handler name 'cam'"));
    }

    #[test]
    fn shared_trigger_line_rejected() {
        let mut config = config();
        config.rig.lights[0].trigger_line = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn line_beyond_executor_rejected() {
        let mut config = config();
        config.rig.cameras[0].trigger_line = Some(config.rig.executor.dlines);
        assert!(config.validate().is_err());
    }

    #[test]
    fn executor_wider_than_a_digital_word_rejected() {
        let mut config = config();
        config.rig.executor.dlines = 64;
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn soft_limits_must_sit_inside_hard_limits() {
        let mut config = config();
        if let Some(stage) = config.rig.z_stage.as_mut() {
            stage.soft_limits = Some((-5.0, 50.0));
        }
        assert!(matches!(
            config.validate(),
            Err(CockpitError::LimitViolation { position, .. }) if position == -5.0
        ));
    }

    #[test]
    fn execution_settings_follow_config() {
        let mut config = config();
        config.experiment.executor_timeout_ms = Some(2500);
        config.storage.max_filesize_mb = Some(64.0);
        let settings = config.execution_settings();
        assert_eq!(settings.executor_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(settings.post_run_grace, Duration::from_secs(1));
        assert_eq!(settings.saver_idle, Duration::from_millis(500));
        assert_eq!(settings.max_filesize_mb, Some(64.0));
    }
}
