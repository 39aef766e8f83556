//! Handler references and action parameters.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::capabilities::{Camera, DeviceHandler, DeviceKind, Executor, LightSource, Positioner};
use crate::time::TimeMs;

/// A handler as it appears in an action table.
///
/// The variant records the handler's role so the scheduler can reach the
/// role trait without downcasting. Equality and hashing use the handler name.
#[derive(Clone)]
pub enum HandlerRef {
    Camera(Arc<dyn Camera>),
    Light(Arc<dyn LightSource>),
    Positioner(Arc<dyn Positioner>),
    Executor(Arc<dyn Executor>),
    Generic(Arc<dyn DeviceHandler>),
}

impl HandlerRef {
    pub fn name(&self) -> &str {
        match self {
            Self::Camera(h) => h.name(),
            Self::Light(h) => h.name(),
            Self::Positioner(h) => h.name(),
            Self::Executor(h) => h.name(),
            Self::Generic(h) => h.name(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Camera(h) => h.kind(),
            Self::Light(h) => h.kind(),
            Self::Positioner(h) => h.kind(),
            Self::Executor(h) => h.kind(),
            Self::Generic(h) => h.kind(),
        }
    }

    pub fn toggle_route(&self) -> Option<ToggleRoute> {
        match self {
            Self::Camera(h) => h.toggle_route(),
            Self::Light(h) => h.toggle_route(),
            Self::Positioner(h) => h.toggle_route(),
            Self::Executor(h) => h.toggle_route(),
            Self::Generic(h) => h.toggle_route(),
        }
    }

    pub fn savefile_info(&self) -> Option<String> {
        match self {
            Self::Camera(h) => h.savefile_info(),
            Self::Light(h) => h.savefile_info(),
            Self::Positioner(h) => h.savefile_info(),
            Self::Executor(h) => h.savefile_info(),
            Self::Generic(h) => h.savefile_info(),
        }
    }

    pub fn is_eligible_for_experiments(&self) -> bool {
        match self {
            Self::Camera(h) => h.is_eligible_for_experiments(),
            Self::Light(h) => h.is_eligible_for_experiments(),
            Self::Positioner(h) => h.is_eligible_for_experiments(),
            Self::Executor(h) => h.is_eligible_for_experiments(),
            Self::Generic(h) => h.is_eligible_for_experiments(),
        }
    }

    pub fn filters_light(&self, light: &str) -> bool {
        match self {
            Self::Camera(h) => h.filters_light(light),
            Self::Light(h) => h.filters_light(light),
            Self::Positioner(h) => h.filters_light(light),
            Self::Executor(h) => h.filters_light(light),
            Self::Generic(h) => h.filters_light(light),
        }
    }

    pub async fn prepare_for_experiment(&self) -> anyhow::Result<()> {
        match self {
            Self::Camera(h) => h.prepare_for_experiment().await,
            Self::Light(h) => h.prepare_for_experiment().await,
            Self::Positioner(h) => h.prepare_for_experiment().await,
            Self::Executor(h) => h.prepare_for_experiment().await,
            Self::Generic(h) => h.prepare_for_experiment().await,
        }
    }

    pub async fn cleanup_after_experiment(&self) -> anyhow::Result<()> {
        match self {
            Self::Camera(h) => h.cleanup_after_experiment().await,
            Self::Light(h) => h.cleanup_after_experiment().await,
            Self::Positioner(h) => h.cleanup_after_experiment().await,
            Self::Executor(h) => h.cleanup_after_experiment().await,
            Self::Generic(h) => h.cleanup_after_experiment().await,
        }
    }

    pub async fn finalize_initialization(&self) -> anyhow::Result<()> {
        match self {
            Self::Camera(h) => h.finalize_initialization().await,
            Self::Light(h) => h.finalize_initialization().await,
            Self::Positioner(h) => h.finalize_initialization().await,
            Self::Executor(h) => h.finalize_initialization().await,
            Self::Generic(h) => h.finalize_initialization().await,
        }
    }

    pub fn as_camera(&self) -> Option<&Arc<dyn Camera>> {
        match self {
            Self::Camera(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_light(&self) -> Option<&Arc<dyn LightSource>> {
        match self {
            Self::Light(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_positioner(&self) -> Option<&Arc<dyn Positioner>> {
        match self {
            Self::Positioner(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_executor(&self) -> Option<&Arc<dyn Executor>> {
        match self {
            Self::Executor(h) => Some(h),
            _ => None,
        }
    }
}

impl PartialEq for HandlerRef {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for HandlerRef {}

impl Hash for HandlerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name().hash(state);
    }
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind().label(), self.name())
    }
}

impl From<Arc<dyn Camera>> for HandlerRef {
    fn from(h: Arc<dyn Camera>) -> Self {
        Self::Camera(h)
    }
}

impl From<Arc<dyn LightSource>> for HandlerRef {
    fn from(h: Arc<dyn LightSource>) -> Self {
        Self::Light(h)
    }
}

impl From<Arc<dyn Positioner>> for HandlerRef {
    fn from(h: Arc<dyn Positioner>) -> Self {
        Self::Positioner(h)
    }
}

impl From<Arc<dyn Executor>> for HandlerRef {
    fn from(h: Arc<dyn Executor>) -> Self {
        Self::Executor(h)
    }
}

impl From<Arc<dyn DeviceHandler>> for HandlerRef {
    fn from(h: Arc<dyn DeviceHandler>) -> Self {
        Self::Generic(h)
    }
}

/// Handler-specific action argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionParam {
    /// Line high/low, light on/off, camera trigger level.
    Digital(bool),
    /// Absolute position for a positioner or analogue line.
    Position(f64),
    /// Entry in an indexed position list (e.g. polariser angles), optionally
    /// chosen per wavelength.
    Indexed {
        index: usize,
        wavelength: Option<f64>,
    },
}

impl fmt::Display for ActionParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digital(v) => write!(f, "{v}"),
            Self::Position(p) => write!(f, "{p:.3}"),
            Self::Indexed {
                index,
                wavelength: Some(wl),
            } => write!(f, "#{index}@{wl}"),
            Self::Indexed { index, .. } => write!(f, "#{index}"),
        }
    }
}

/// Redirection of a handler's toggles to another handler.
///
/// Devices triggered through a proxy line (spatial light modulators, for
/// example) toggle that line instead of themselves.
#[derive(Debug, Clone)]
pub struct ToggleRoute {
    pub target: HandlerRef,
    /// Minimum pulse width the device needs.
    pub pulse: TimeMs,
    /// Time the device needs after the pulse before it is ready.
    pub response: TimeMs,
}
