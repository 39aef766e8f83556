use std::sync::Arc;

use cockpit_core::{ActionParam, ActionTable, CockpitResult, HandlerRef, Positioner, TimeMs};
use tracing::debug;

use super::{hold_then_move, ActionGenerator, GenerationContext, EXPOSURE_GAP};

/// Image every exposure setting at each plane of a Z stack.
///
/// Without a Z positioner the stack collapses to a single plane and no
/// stage actions are generated.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZStack;

impl ActionGenerator for ZStack {
    fn name(&self) -> &str {
        "z-stack"
    }

    fn generate_actions(&self, ctx: &mut GenerationContext<'_>) -> CockpitResult<ActionTable> {
        let params = ctx.params;
        let stage = params
            .z_positioner
            .as_ref()
            .map(|z| (Arc::clone(z), HandlerRef::from(Arc::clone(z))));
        let mut table = ActionTable::new();
        let mut cur = TimeMs::ZERO;
        let mut prev_altitude: Option<f64> = None;

        for slice in 0..params.num_z_slices() {
            let target = ctx.z_start + params.slice_height * slice as f64;
            if let Some((positioner, handler)) = &stage {
                match prev_altitude {
                    // Hold the previous plane through its exposures, then move.
                    Some(prev) => {
                        let (motion, settle) = positioner.movement_time(prev, target)?;
                        hold_then_move(
                            &mut table,
                            handler,
                            cur,
                            motion,
                            ActionParam::Position(prev),
                            ActionParam::Position(target),
                        );
                        cur += motion + settle;
                    }
                    None => {
                        table.add_action(cur, handler, ActionParam::Position(target));
                    }
                }
            }
            prev_altitude = Some(target);

            for setting in &params.exposure_settings {
                cur = ctx.planner.expose(cur, &setting.cameras, &setting.lights, &mut table)?;
                cur += EXPOSURE_GAP;
            }
            debug!(slice, altitude = target, end = %cur, "slice planned");
        }

        if let Some((positioner, handler)) = &stage {
            let top = prev_altitude.unwrap_or(ctx.z_start);
            let (motion, settle) = positioner.movement_time(top, ctx.z_start)?;
            hold_then_move(
                &mut table,
                handler,
                cur,
                motion,
                ActionParam::Position(top),
                ActionParam::Position(ctx.z_start),
            );
            cur += motion;

            // Only needed when another repetition follows straight away.
            let mut ready = TimeMs::ZERO;
            if params.num_reps > 1 {
                for setting in &params.exposure_settings {
                    for camera in &setting.cameras {
                        let camera_ready = ctx.planner.time_when_camera_can_expose(&table, camera)?;
                        ready = ready.max(camera_ready);
                    }
                }
            }
            let end = (cur + settle).max(ready);
            if end > cur {
                table.add_action(end, handler, ActionParam::Position(ctx.z_start));
            }
        }
        Ok(table)
    }
}
