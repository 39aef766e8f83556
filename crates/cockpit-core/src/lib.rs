//! Core types for the cockpit experiment engine.
//!
//! - [`time`]: exact schedule time
//! - [`action_table`]: the per-repetition schedule
//! - [`capabilities`] and [`handler`]: device handler roles and references
//! - [`events`]: named publish/subscribe bus
//! - [`cancel`]: cooperative abort token
//! - [`depot`] and [`context`]: handler registry and shared run state

pub mod action_table;
pub mod cancel;
pub mod capabilities;
pub mod context;
pub mod data;
pub mod depot;
pub mod error;
pub mod events;
pub mod handler;
pub mod time;

pub use action_table::{Action, ActionTable, TOGGLE_TIME};
pub use cancel::AbortToken;
pub use capabilities::{
    Axis, Camera, DeviceHandler, DeviceKind, Executor, ExposureMode, LightSource, PositionLimits,
    Positioner,
};
pub use context::{ExperimentRecord, RunContext, RunGuard};
pub use data::Image;
pub use depot::DeviceDepot;
pub use error::{CockpitError, CockpitResult, HardwareContext};
pub use events::{EventBus, EventPayload, Released};
pub use handler::{ActionParam, HandlerRef, ToggleRoute};
pub use time::TimeMs;
