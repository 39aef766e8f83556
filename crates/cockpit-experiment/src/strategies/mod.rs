//! Acquisition strategies.
//!
//! A strategy turns [`ExperimentParams`] into one repetition's action table.
//! All strategies share the [`ExposurePlanner`], so camera readiness and
//! image bookkeeping work the same whatever the acquisition pattern.

mod structured_illumination;
mod stuttered;
mod swept_shutter;
mod zstack;

pub use structured_illumination::{CollectionOrder, SiPosition, StructuredIllumination};
pub use stuttered::{SampleRate, StutteredZStack};
pub use swept_shutter::SweptShutter;
pub use zstack::ZStack;

use std::path::PathBuf;

use cockpit_core::{ActionParam, ActionTable, CockpitResult, HandlerRef, TimeMs};

use crate::params::ExperimentParams;
use crate::planner::ExposurePlanner;

/// Gap left after each exposure so that exposures are strictly ordered.
pub const EXPOSURE_GAP: TimeMs = TimeMs::PICOSECOND;

/// State a strategy builds its table from.
pub struct GenerationContext<'a> {
    pub params: &'a ExperimentParams,
    pub planner: &'a mut ExposurePlanner,
    /// Z altitude of the bottom of the stack once the stage got there.
    pub z_start: f64,
}

/// Repetitions run back to back at one repeat duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepBlock {
    pub num_reps: u32,
    pub rep_duration: TimeMs,
}

pub trait ActionGenerator: Send + Sync {
    /// Short name, used in logs and the experiment record.
    fn name(&self) -> &str;

    /// Text appended to the experiment metadata.
    fn metadata(&self) -> Option<String> {
        None
    }

    /// Handlers driven by the strategy beyond those in the parameters.
    fn handlers(&self) -> Vec<HandlerRef> {
        Vec::new()
    }

    fn generate_actions(&self, ctx: &mut GenerationContext<'_>) -> CockpitResult<ActionTable>;

    /// Split the run into blocks. The table is built once and reused by
    /// every block.
    fn rep_blocks(&self, num_reps: u32, rep_duration: TimeMs) -> Vec<RepBlock> {
        vec![RepBlock {
            num_reps,
            rep_duration,
        }]
    }

    /// Post-process the saved files once the run has ended.
    fn finish_files(&self, _files: &[PathBuf], _params: &ExperimentParams) -> CockpitResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn ActionGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionGenerator").field("name", &self.name()).finish()
    }
}

/// Hold `handler` at `from` until `at`, then move it to `to` after `motion`.
///
/// The hold is left out when the move is instantaneous: two different
/// positions at the same time would conflict.
pub(crate) fn hold_then_move(
    table: &mut ActionTable,
    handler: &HandlerRef,
    at: TimeMs,
    motion: TimeMs,
    from: ActionParam,
    to: ActionParam,
) {
    if motion > TimeMs::ZERO {
        table.add_action(at, handler, from);
    }
    table.add_action(at + motion, handler, to);
}
