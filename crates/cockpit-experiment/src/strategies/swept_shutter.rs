use std::sync::Arc;

use cockpit_core::{
    ActionParam, ActionTable, CockpitError, CockpitResult, HandlerRef, Positioner, TimeMs,
};
use tracing::debug;

use super::{hold_then_move, ActionGenerator, GenerationContext, EXPOSURE_GAP};
use crate::params::LightExposure;

/// One exposure per setting while Z sweeps from the bottom to the top of the
/// stack, so each image integrates the whole volume.
///
/// Every light stays on for at least the time the stage needs to cross the
/// stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweptShutter;

impl ActionGenerator for SweptShutter {
    fn name(&self) -> &str {
        "swept shutter"
    }

    fn generate_actions(&self, ctx: &mut GenerationContext<'_>) -> CockpitResult<ActionTable> {
        let params = ctx.params;
        let stage = params.z_positioner.as_ref().ok_or_else(|| {
            CockpitError::MissingHandler("swept shutter needs a Z positioner".to_string())
        })?;
        let handler = HandlerRef::from(Arc::clone(stage));
        let bottom = ctx.z_start;
        let top = bottom + params.z_height;
        let (sweep, sweep_settle) = stage.movement_time(bottom, top)?;
        let (back, back_settle) = stage.movement_time(top, bottom)?;

        let mut table = ActionTable::new();
        let mut cur = TimeMs::ZERO;
        table.add_action(cur, &handler, ActionParam::Position(bottom));

        for setting in &params.exposure_settings {
            let mut start = cur;
            for camera in &setting.cameras {
                start = start.max(ctx.planner.time_when_camera_can_expose(&table, camera)?);
            }
            let lights: Vec<LightExposure> = setting
                .lights
                .iter()
                .map(|l| LightExposure::new(Arc::clone(&l.light), l.time.max(sweep)))
                .collect();
            // Sit at the bottom until the shutter opens.
            table.add_action(start, &handler, ActionParam::Position(bottom));
            let end = ctx.planner.expose(start, &setting.cameras, &lights, &mut table)?;
            let end = end.max(start + EXPOSURE_GAP);
            table.add_action(end, &handler, ActionParam::Position(top));
            debug!(start = %start, end = %end, "sweep planned");

            cur = end + sweep_settle.max(EXPOSURE_GAP);
            hold_then_move(
                &mut table,
                &handler,
                cur,
                back,
                ActionParam::Position(top),
                ActionParam::Position(bottom),
            );
            cur += back + EXPOSURE_GAP;
        }

        // Only needed when another repetition follows straight away.
        let mut ready = TimeMs::ZERO;
        if params.num_reps > 1 {
            for setting in &params.exposure_settings {
                for camera in &setting.cameras {
                    ready = ready.max(ctx.planner.time_when_camera_can_expose(&table, camera)?);
                }
            }
        }
        let end = (cur + back_settle).max(ready);
        if end > cur {
            table.add_action(end, &handler, ActionParam::Position(bottom));
        }
        Ok(table)
    }
}
