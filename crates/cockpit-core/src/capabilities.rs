//! Handler capability traits
//!
//! Every piece of hardware an experiment touches is reached through a handler.
//! Handlers implement [`DeviceHandler`] plus exactly one role trait:
//!
//! - [`Camera`]: exposure mode, readout time, exposure control, soft trigger
//! - [`LightSource`]: wavelength and power for provenance, switched by the table
//! - [`Positioner`]: movement timing, limits and absolute moves
//! - [`Executor`]: runs contiguous slices of an [`ActionTable`] on its own clock
//!
//! Handlers are wrapped in a [`HandlerRef`](crate::handler::HandlerRef) when
//! they are placed in a table.
//!
//! # Design Philosophy
//!
//! - Scheduling queries (`exposure_mode`, `movement_time`, ...) are synchronous
//!   and must return cached values; table construction never blocks.
//! - Hardware actions are async (`#[async_trait]`) and use `anyhow::Result`.
//! - All timing returned to the scheduler is an exact [`TimeMs`].

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action_table::ActionTable;
use crate::error::{CockpitError, CockpitResult};
use crate::handler::ToggleRoute;
use crate::time::TimeMs;

/// How a camera expects to be triggered.
///
/// The discriminants match the values used on the wire by camera servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureMode {
    /// Frame-transfer: exposes continuously, triggered at the end of an exposure.
    TriggerAfter = 0,
    /// Triggered at the start; exposure duration is set on the camera.
    TriggerBefore = 1,
    /// Exposes while the trigger line is high.
    TriggerDuration = 2,
    /// Software triggered; only a start action is placed in the table.
    TriggerSoft = 3,
    /// Like `TriggerDuration`, started early by the readout time on rolling shutters.
    TriggerDurationPseudoGlobal = 4,
}

impl TryFrom<u8> for ExposureMode {
    type Error = CockpitError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::TriggerAfter),
            1 => Ok(Self::TriggerBefore),
            2 => Ok(Self::TriggerDuration),
            3 => Ok(Self::TriggerSoft),
            4 => Ok(Self::TriggerDurationPseudoGlobal),
            other => Err(CockpitError::Configuration(format!(
                "unknown exposure mode {other}"
            ))),
        }
    }
}

/// Device category, used to group handlers in file titles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Camera,
    LightSource,
    LightFilter,
    LightPower,
    StagePositioner,
    GenericPositioner,
    Executor,
    Generic,
}

impl DeviceKind {
    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::LightSource => "light source",
            Self::LightFilter => "light filter",
            Self::LightPower => "light power",
            Self::StagePositioner => "stage positioner",
            Self::GenericPositioner => "generic positioner",
            Self::Executor => "executor",
            Self::Generic => "generic device",
        }
    }
}

/// Stage axis a positioner drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    X,
    Y,
    Z,
    /// Not a stage axis (analogue lines, rotators, ...).
    None,
}

// =============================================================================
// Capability Traits
// =============================================================================

/// Behaviour shared by every handler.
///
/// Names are unique within a [`DeviceDepot`](crate::depot::DeviceDepot) and
/// serve as handler identity.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    /// Handlers that are switched off or unplugged report `false`.
    fn is_eligible_for_experiments(&self) -> bool {
        true
    }

    /// Short description of the handler state for file titles.
    fn savefile_info(&self) -> Option<String> {
        None
    }

    /// Where toggles for this handler really go. `None` toggles the handler itself.
    fn toggle_route(&self) -> Option<ToggleRoute> {
        None
    }

    /// Light filters report whether they sit in the path of `light`.
    fn filters_light(&self, _light: &str) -> bool {
        false
    }

    async fn prepare_for_experiment(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup_after_experiment(&self) -> Result<()> {
        Ok(())
    }

    /// Second-stage initialisation run once all handlers exist.
    async fn finalize_initialization(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability: Camera
///
/// # Contract
/// - `time_between_exposures` is the readout time and must be exact; cameras
///   that cannot report it exactly return [`CockpitError::InexactTime`]
/// - `exposure_time` is the value last set through `set_exposure_time`
#[async_trait]
pub trait Camera: DeviceHandler {
    fn exposure_mode(&self) -> ExposureMode;

    fn time_between_exposures(&self) -> CockpitResult<TimeMs>;

    fn exposure_time(&self) -> TimeMs;

    fn min_exposure_time(&self) -> TimeMs {
        TimeMs::ZERO
    }

    /// Image width and height in pixels.
    fn image_size(&self) -> (u32, u32);

    /// Emission wavelength in nm, if known.
    fn wavelength(&self) -> Option<f64> {
        None
    }

    async fn set_exposure_time(&self, time: TimeMs) -> Result<()>;

    fn supports_soft_trigger(&self) -> bool {
        false
    }

    async fn soft_trigger(&self) -> Result<()> {
        anyhow::bail!("{} has no software trigger", self.name())
    }
}

/// Capability: Light Source
#[async_trait]
pub trait LightSource: DeviceHandler {
    /// Excitation wavelength in nm.
    fn wavelength(&self) -> Option<f64>;

    /// Ambient light is never switched by the table.
    fn is_ambient(&self) -> bool {
        self.name() == "ambient"
    }

    /// Output power in mW, if the source reports one.
    fn power_mw(&self) -> Option<f64> {
        None
    }
}

/// Capability: Positioner
///
/// # Contract
/// - Positions are in device-native units (µm for stages)
/// - `movement_time` returns `(motion, stabilization)`; both are exact
/// - Moves outside the soft limits fail with [`CockpitError::LimitViolation`]
#[async_trait]
pub trait Positioner: DeviceHandler {
    fn axis(&self) -> Axis;

    fn movement_time(&self, start: f64, end: f64) -> CockpitResult<(TimeMs, TimeMs)>;

    fn limits(&self) -> PositionLimits;

    fn set_soft_limits(&self, min: f64, max: f64) -> CockpitResult<()>;

    async fn position(&self) -> Result<f64>;

    async fn move_absolute(&self, position: f64) -> Result<()>;

    /// Wait until motion has stopped.
    async fn wait_settled(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability: Executor
///
/// An executor runs a contiguous slice of an action table on hardware with
/// its own clock. Encoding the slice into device commands is entirely the
/// executor's business.
///
/// # Contract
/// - `num_runnable_lines` does not mutate anything
/// - `execute_table` returns once the slice (and all `num_reps` repeats) has
///   run and the executor's completion event has been published
#[async_trait]
pub trait Executor: DeviceHandler {
    /// Rewrite the table before it runs. Called after the first sort.
    fn examine_actions(&self, _table: &mut ActionTable) -> CockpitResult<()> {
        Ok(())
    }

    /// How many contiguous lines starting at `from` this executor can run.
    fn num_runnable_lines(&self, table: &ActionTable, from: usize) -> usize;

    async fn execute_table(
        &self,
        table: &ActionTable,
        start: usize,
        stop: usize,
        num_reps: u32,
        rep_duration: Option<TimeMs>,
    ) -> Result<()>;

    async fn read_digital(&self) -> Result<u32> {
        anyhow::bail!("{} has no digital lines", self.name())
    }

    async fn write_digital(&self, _state: u32) -> Result<()> {
        anyhow::bail!("{} has no digital lines", self.name())
    }

    async fn read_analog(&self, _line: usize) -> Result<f64> {
        anyhow::bail!("{} has no analogue lines", self.name())
    }

    async fn write_analog(&self, _line: usize, _level: f64) -> Result<()> {
        anyhow::bail!("{} has no analogue lines", self.name())
    }
}

// =============================================================================
// Position limits
// =============================================================================

/// Hard (absolute hardware) and soft (user) bounds of a positioner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionLimits {
    pub hard: (f64, f64),
    pub soft: (f64, f64),
}

impl PositionLimits {
    /// Soft limits start equal to the hard limits.
    pub fn new(min: f64, max: f64) -> CockpitResult<Self> {
        if min > max {
            return Err(CockpitError::Configuration(format!(
                "hard limits inverted: {min} > {max}"
            )));
        }
        Ok(Self {
            hard: (min, max),
            soft: (min, max),
        })
    }

    pub fn set_soft(&mut self, min: f64, max: f64) -> CockpitResult<()> {
        if min > max || min < self.hard.0 || max > self.hard.1 {
            return Err(CockpitError::Configuration(format!(
                "soft limits [{min}, {max}] must lie within hard limits [{}, {}]",
                self.hard.0, self.hard.1
            )));
        }
        self.soft = (min, max);
        Ok(())
    }

    pub fn check(&self, handler: &str, position: f64) -> CockpitResult<()> {
        let (min, max) = self.soft;
        if position < min || position > max {
            return Err(CockpitError::LimitViolation {
                handler: handler.to_string(),
                position,
                min,
                max,
            });
        }
        Ok(())
    }
}
