//! Simulated camera driven by trigger edges or a software trigger.
//!
//! Frames are published on the camera's "new image" event the way a camera
//! server delivers them: a hardware-triggered camera produces a frame on the
//! rising edge of its trigger line, except duration-mode cameras which
//! produce it on the falling edge, once the exposure has ended.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use async_trait::async_trait;
use cockpit_core::events::{self, EventPayload};
use cockpit_core::{
    Camera, CockpitResult, DeviceHandler, DeviceKind, EventBus, ExposureMode, Image, TimeMs,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use crate::mock_executor_backend::TriggerListener;
use crate::pattern::generate_test_pattern;

/// Configuration for a simulated camera
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockCameraConfig {
    pub name: String,

    #[serde(default = "default_exposure_mode")]
    pub exposure_mode: ExposureMode,

    /// Readout time (default: 5 ms)
    #[serde(default = "default_readout")]
    pub readout_time: TimeMs,

    /// Initial exposure (default: 10 ms)
    #[serde(default = "default_exposure")]
    pub exposure_time: TimeMs,

    #[serde(default)]
    pub min_exposure_time: TimeMs,

    /// Frame width in pixels (default: 64)
    #[serde(default = "default_size")]
    pub width: u32,

    /// Frame height in pixels (default: 64)
    #[serde(default = "default_size")]
    pub height: u32,

    /// Emission wavelength in nm
    #[serde(default)]
    pub wavelength: Option<f64>,

    /// Executor digital line wired to the trigger input; `None` for
    /// software-triggered cameras.
    #[serde(default)]
    pub trigger_line: Option<u32>,
}

fn default_exposure_mode() -> ExposureMode {
    ExposureMode::TriggerBefore
}
fn default_readout() -> TimeMs {
    TimeMs::from_ms(5)
}
fn default_exposure() -> TimeMs {
    TimeMs::from_ms(10)
}
fn default_size() -> u32 {
    64
}

impl MockCameraConfig {
    pub fn new(name: impl Into<String>, exposure_mode: ExposureMode) -> Self {
        Self {
            name: name.into(),
            exposure_mode,
            readout_time: default_readout(),
            exposure_time: default_exposure(),
            min_exposure_time: TimeMs::ZERO,
            width: default_size(),
            height: default_size(),
            wavelength: None,
            trigger_line: None,
        }
    }
}

pub struct MockCamera {
    config: MockCameraConfig,
    exposure: Mutex<TimeMs>,
    bus: Arc<EventBus>,
    mode: MockMode,
    errors: ErrorConfig,
    timing: TimingConfig,
    frames: AtomicU64,
    line_high: AtomicBool,
    enabled: AtomicBool,
    epoch: Instant,
}

/// Builder for [`MockCamera`]
pub struct MockCameraBuilder {
    config: MockCameraConfig,
    bus: Arc<EventBus>,
    mode: MockMode,
    errors: ErrorConfig,
    timing: TimingConfig,
}

impl MockCameraBuilder {
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn error_config(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    pub fn timing_config(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn build(self) -> Arc<MockCamera> {
        Arc::new(MockCamera {
            exposure: Mutex::new(self.config.exposure_time),
            config: self.config,
            bus: self.bus,
            mode: self.mode,
            errors: self.errors,
            timing: self.timing,
            frames: AtomicU64::new(0),
            line_high: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            epoch: Instant::now(),
        })
    }
}

impl MockCamera {
    pub fn builder(config: MockCameraConfig, bus: Arc<EventBus>) -> MockCameraBuilder {
        MockCameraBuilder {
            config,
            bus,
            mode: MockMode::default(),
            errors: ErrorConfig::none(),
            timing: TimingConfig::camera(),
        }
    }

    pub fn config(&self) -> &MockCameraConfig {
        &self.config
    }

    pub fn trigger_line(&self) -> Option<u32> {
        self.config.trigger_line
    }

    /// Frames published so far.
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Switch the camera on or off for experiments.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn emit_frame(&self) {
        let frame_num = self.frames.fetch_add(1, Ordering::SeqCst);
        let pixels = generate_test_pattern(self.config.width, self.config.height, frame_num);
        let image = Image::from_u16(self.config.width, self.config.height, pixels);
        debug!(camera = %self.config.name, frame = frame_num, "frame");
        self.bus.publish(
            &events::new_image(&self.config.name),
            EventPayload::Image {
                camera: self.config.name.clone(),
                image: Arc::new(image),
                timestamp: self.epoch.elapsed().as_secs_f64(),
            },
        );
    }
}

impl TriggerListener for MockCamera {
    fn on_edge(&self, high: bool) {
        if self.line_high.swap(high, Ordering::SeqCst) == high {
            return;
        }
        match self.config.exposure_mode {
            ExposureMode::TriggerDuration | ExposureMode::TriggerDurationPseudoGlobal => {
                if !high {
                    self.emit_frame();
                }
            }
            ExposureMode::TriggerSoft => {
                warn!(camera = %self.config.name, "software camera saw a trigger edge");
            }
            ExposureMode::TriggerAfter | ExposureMode::TriggerBefore => {
                if high {
                    self.emit_frame();
                }
            }
        }
    }
}

#[async_trait]
impl DeviceHandler for MockCamera {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Camera
    }

    fn is_eligible_for_experiments(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn savefile_info(&self) -> Option<String> {
        Some(format!(
            "{}x{} {} ms",
            self.config.width,
            self.config.height,
            *self.exposure.lock()
        ))
    }

    async fn prepare_for_experiment(&self) -> Result<()> {
        self.errors.check_operation(&self.config.name, "prepare")?;
        self.timing.communicate(self.mode).await;
        self.line_high.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Camera for MockCamera {
    fn exposure_mode(&self) -> ExposureMode {
        self.config.exposure_mode
    }

    fn time_between_exposures(&self) -> CockpitResult<TimeMs> {
        Ok(self.config.readout_time)
    }

    fn exposure_time(&self) -> TimeMs {
        *self.exposure.lock()
    }

    fn min_exposure_time(&self) -> TimeMs {
        self.config.min_exposure_time
    }

    fn image_size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn wavelength(&self) -> Option<f64> {
        self.config.wavelength
    }

    async fn set_exposure_time(&self, time: TimeMs) -> Result<()> {
        self.errors.check_operation(&self.config.name, "set_exposure")?;
        if time < self.config.min_exposure_time {
            bail!(
                "{}: exposure {} ms below minimum {} ms",
                self.config.name,
                time,
                self.config.min_exposure_time
            );
        }
        self.timing.communicate(self.mode).await;
        *self.exposure.lock() = time;
        Ok(())
    }

    fn supports_soft_trigger(&self) -> bool {
        self.config.exposure_mode == ExposureMode::TriggerSoft
    }

    async fn soft_trigger(&self) -> Result<()> {
        if !self.supports_soft_trigger() {
            bail!("{} has no software trigger", self.config.name);
        }
        self.errors.check_operation(&self.config.name, "trigger")?;
        self.timing.communicate(self.mode).await;
        self.emit_frame();
        Ok(())
    }
}

impl std::fmt::Debug for MockCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCamera")
            .field("name", &self.config.name)
            .field("exposure_mode", &self.config.exposure_mode)
            .field("frames", &self.frame_count())
            .finish()
    }
}
