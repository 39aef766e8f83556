//! Positioners backed by an executor's analogue output line.
//!
//! Output levels are in native units (volts, amps or ADU); positions are in
//! experimental units (µm, degrees). The mapping is
//! `level = gain * (offset + position)`.

use std::collections::BTreeMap;
use std::sync::Weak;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cockpit_core::{
    Axis, CockpitError, CockpitResult, DeviceHandler, DeviceKind, PositionLimits, Positioner,
    TimeMs,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Something that can drive analogue lines.
#[async_trait]
pub trait AnalogOutput: Send + Sync {
    async fn set_analog_line(&self, line: usize, level: f64) -> Result<()>;

    async fn get_analog_line(&self, line: usize) -> Result<f64>;
}

/// Named positions a line can be sent to by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexedPositions {
    List(Vec<f64>),
    ByWavelength {
        /// Position lists keyed by wavelength in nm.
        table: BTreeMap<u32, Vec<f64>>,
        #[serde(default)]
        default: Option<Vec<f64>>,
    },
}

impl Default for IndexedPositions {
    fn default() -> Self {
        IndexedPositions::List(Vec::new())
    }
}

impl IndexedPositions {
    /// Position `index`, taken from the list for the wavelength closest to
    /// `wavelength` when positions are wavelength dependent.
    pub fn resolve(&self, index: usize, wavelength: Option<f64>) -> Option<f64> {
        let list = match (self, wavelength) {
            (IndexedPositions::List(list), _) => list,
            (IndexedPositions::ByWavelength { table, .. }, Some(wl)) => {
                table
                    .iter()
                    .min_by(|(a, _), (b, _)| {
                        let da = (f64::from(**a) - wl).abs();
                        let db = (f64::from(**b) - wl).abs();
                        da.total_cmp(&db)
                    })
                    .map(|(_, list)| list)?
            }
            (IndexedPositions::ByWavelength { default, .. }, None) => default.as_ref()?,
        };
        list.get(index).copied()
    }
}

/// Movement timing reported for an analogue line.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum MovementTime {
    #[default]
    Instant,
    /// Constant motion time, no stabilisation.
    Fixed(TimeMs),
}

pub struct AnalogLineHandler {
    name: String,
    line: usize,
    gain: f64,
    offset: f64,
    movement: MovementTime,
    positions: IndexedPositions,
    limits: Mutex<PositionLimits>,
    saved: Mutex<Option<f64>>,
    source: Weak<dyn AnalogOutput>,
}

impl AnalogLineHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        line: usize,
        offset: f64,
        gain: f64,
        movement: MovementTime,
        positions: IndexedPositions,
        limits: PositionLimits,
        source: Weak<dyn AnalogOutput>,
    ) -> Self {
        Self {
            name: name.into(),
            line,
            gain,
            offset,
            movement,
            positions,
            limits: Mutex::new(limits),
            saved: Mutex::new(None),
            source,
        }
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn pos_to_native(&self, position: f64) -> f64 {
        self.gain * (self.offset + position)
    }

    pub fn native_to_pos(&self, native: f64) -> f64 {
        native / self.gain - self.offset
    }

    pub fn indexed_position(&self, index: usize, wavelength: Option<f64>) -> CockpitResult<f64> {
        self.positions.resolve(index, wavelength).ok_or_else(|| {
            CockpitError::Configuration(format!(
                "'{}' has no indexed position {index} for wavelength {wavelength:?}",
                self.name
            ))
        })
    }

    fn source(&self) -> Result<std::sync::Arc<dyn AnalogOutput>> {
        self.source
            .upgrade()
            .ok_or_else(|| anyhow!("executor behind '{}' is gone", self.name))
    }

    pub async fn save_position(&self) -> Result<()> {
        let position = self.position().await?;
        *self.saved.lock() = Some(position);
        Ok(())
    }

    pub async fn restore_position(&self) -> Result<()> {
        let saved = *self.saved.lock();
        match saved {
            Some(position) => self.move_absolute(position).await,
            None => Ok(()),
        }
    }

    pub async fn move_relative(&self, delta: f64) -> Result<()> {
        let position = self.position().await?;
        self.move_absolute(position + delta).await
    }
}

#[async_trait]
impl DeviceHandler for AnalogLineHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::GenericPositioner
    }

    fn savefile_info(&self) -> Option<String> {
        Some(format!("line {}", self.line))
    }
}

#[async_trait]
impl Positioner for AnalogLineHandler {
    fn axis(&self) -> Axis {
        Axis::None
    }

    fn movement_time(&self, _start: f64, _end: f64) -> CockpitResult<(TimeMs, TimeMs)> {
        Ok(match self.movement {
            MovementTime::Instant => (TimeMs::ZERO, TimeMs::ZERO),
            MovementTime::Fixed(t) => (t, TimeMs::ZERO),
        })
    }

    fn limits(&self) -> PositionLimits {
        *self.limits.lock()
    }

    fn set_soft_limits(&self, min: f64, max: f64) -> CockpitResult<()> {
        self.limits.lock().set_soft(min, max)
    }

    async fn position(&self) -> Result<f64> {
        let native = self.source()?.get_analog_line(self.line).await?;
        Ok(self.native_to_pos(native))
    }

    async fn move_absolute(&self, position: f64) -> Result<()> {
        self.limits.lock().check(&self.name, position)?;
        self.source()?
            .set_analog_line(self.line, self.pos_to_native(position))
            .await
    }
}

impl std::fmt::Debug for AnalogLineHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalogLineHandler")
            .field("name", &self.name)
            .field("line", &self.line)
            .field("gain", &self.gain)
            .field("offset", &self.offset)
            .finish()
    }
}
