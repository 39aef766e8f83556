//! Simulated stage axis moved in software.
//!
//! Movement time is `distance / speed`, rounded up to the next microsecond so
//! it stays exact, followed by a fixed stabilisation time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cockpit_core::{
    Axis, CockpitResult, DeviceHandler, DeviceKind, PositionLimits, Positioner, TimeMs,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{ErrorConfig, MockMode, TimingConfig};

/// Configuration for a simulated stage axis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockStageConfig {
    pub name: String,

    #[serde(default = "default_axis")]
    pub axis: Axis,

    /// Hard limits in µm
    pub limits: (f64, f64),

    /// Soft limits in µm, the hard limits when absent
    #[serde(default)]
    pub soft_limits: Option<(f64, f64)>,

    /// µm per ms (default: 10)
    #[serde(default = "default_speed")]
    pub speed_um_per_ms: f64,

    /// Stabilisation time after every move (default: 1 ms)
    #[serde(default = "default_settle")]
    pub settle_time: TimeMs,

    #[serde(default)]
    pub initial_position: f64,
}

fn default_axis() -> Axis {
    Axis::Z
}
fn default_speed() -> f64 {
    10.0
}
fn default_settle() -> TimeMs {
    TimeMs::from_ms(1)
}

impl MockStageConfig {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            axis: default_axis(),
            limits: (min, max),
            soft_limits: None,
            speed_um_per_ms: default_speed(),
            settle_time: default_settle(),
            initial_position: 0.0,
        }
    }
}

pub struct MockStage {
    config: MockStageConfig,
    limits: Mutex<PositionLimits>,
    position: Mutex<f64>,
    history: Mutex<Vec<f64>>,
    mode: MockMode,
    errors: ErrorConfig,
    timing: TimingConfig,
}

impl MockStage {
    pub fn new(config: MockStageConfig, mode: MockMode) -> CockpitResult<Arc<Self>> {
        Self::with_errors(config, mode, ErrorConfig::none())
    }

    pub fn with_errors(
        config: MockStageConfig,
        mode: MockMode,
        errors: ErrorConfig,
    ) -> CockpitResult<Arc<Self>> {
        let mut limits = PositionLimits::new(config.limits.0, config.limits.1)?;
        if let Some((min, max)) = config.soft_limits {
            limits.set_soft(min, max)?;
        }
        Ok(Arc::new(Self {
            position: Mutex::new(config.initial_position),
            config,
            limits: Mutex::new(limits),
            history: Mutex::new(Vec::new()),
            mode,
            errors,
            timing: TimingConfig::stage(),
        }))
    }

    /// Every position the stage was sent to, oldest first.
    pub fn move_history(&self) -> Vec<f64> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl DeviceHandler for MockStage {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::StagePositioner
    }

    fn savefile_info(&self) -> Option<String> {
        Some(format!("{:.2} um", *self.position.lock()))
    }
}

#[async_trait]
impl Positioner for MockStage {
    fn axis(&self) -> Axis {
        self.config.axis
    }

    fn movement_time(&self, start: f64, end: f64) -> CockpitResult<(TimeMs, TimeMs)> {
        let distance = (end - start).abs();
        let us = (distance * 1000.0 / self.config.speed_um_per_ms).ceil() as i64;
        Ok((TimeMs::from_us(us), self.config.settle_time))
    }

    fn limits(&self) -> PositionLimits {
        *self.limits.lock()
    }

    fn set_soft_limits(&self, min: f64, max: f64) -> CockpitResult<()> {
        self.limits.lock().set_soft(min, max)
    }

    async fn position(&self) -> Result<f64> {
        self.errors.check_operation(&self.config.name, "position")?;
        Ok(*self.position.lock())
    }

    async fn move_absolute(&self, position: f64) -> Result<()> {
        self.limits.lock().check(&self.config.name, position)?;
        self.errors.check_operation(&self.config.name, "move")?;
        let start = *self.position.lock();
        if self.mode.is_realistic() {
            let (motion, _) = self.movement_time(start, position)?;
            tokio::time::sleep(motion.as_duration()).await;
        }
        debug!(stage = %self.config.name, from = start, to = position, "move");
        *self.position.lock() = position;
        self.history.lock().push(position);
        Ok(())
    }

    async fn wait_settled(&self) -> Result<()> {
        if self.mode.is_realistic() {
            tokio::time::sleep(
                self.config.settle_time.as_duration()
                    + Duration::from_millis(self.timing.settling_time_ms),
            )
            .await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MockStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStage")
            .field("name", &self.config.name)
            .field("position", &*self.position.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cockpit_core::CockpitError;

    #[test]
    fn movement_time_rounds_up_to_microseconds() {
        let stage =
            MockStage::new(MockStageConfig::new("z", 0.0, 100.0), MockMode::Instant).unwrap();
        let (motion, settle) = stage.movement_time(0.0, 0.25).unwrap();
        assert_eq!(motion, TimeMs::from_us(25));
        assert_eq!(settle, TimeMs::from_ms(1));
        let (motion, _) = stage.movement_time(0.0, 0.00001).unwrap();
        assert_eq!(motion, TimeMs::from_us(1));
    }

    #[tokio::test]
    async fn moves_respect_soft_limits() {
        let mut config = MockStageConfig::new("z", 0.0, 100.0);
        config.soft_limits = Some((10.0, 90.0));
        let stage = MockStage::new(config, MockMode::Instant).unwrap();
        stage.move_absolute(50.0).await.unwrap();
        let err = stage.move_absolute(95.0).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CockpitError>(),
            Some(CockpitError::LimitViolation { .. })
        ));
        assert_eq!(stage.position().await.unwrap(), 50.0);
        assert_eq!(stage.move_history(), vec![50.0]);
    }

    #[test]
    fn soft_limits_outside_hard_limits_rejected() {
        let mut config = MockStageConfig::new("z", 0.0, 100.0);
        config.soft_limits = Some((-10.0, 90.0));
        assert!(MockStage::new(config, MockMode::Instant).is_err());
    }
}
