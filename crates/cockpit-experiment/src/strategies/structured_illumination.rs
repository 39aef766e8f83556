//! Structured illumination: a Z stack imaged at several pattern angles and
//! phases.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use cockpit_core::{
    ActionParam, ActionTable, CockpitError, CockpitResult, DeviceHandler, HandlerRef, LightSource,
    Positioner, TimeMs,
};
use cockpit_storage::{reorder_stack, PackedStack, StackAxis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{hold_then_move, ActionGenerator, GenerationContext};
use crate::params::{ExperimentParams, ExposureSetting, LightExposure};

/// Wavelength recorded for transmitted light.
const AMBIENT_WAVELENGTH: f64 = -50.0;
/// Separates actions that must not share a timestamp.
const NUDGE: TimeMs = TimeMs::from_ns(1);
/// Step between angle, phase and Z changes.
const ORDERING_STEP: TimeMs = TimeMs::from_us(1);
/// Time given to the first phase and Z moves.
const INITIAL_SETTLE: TimeMs = TimeMs::from_ms(1);
/// Wait after the first pattern trigger.
const PATTERN_SETTLE: TimeMs = TimeMs::from_ms(5);

/// Nesting of the angle, phase and Z loops, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionOrder {
    #[default]
    ZAnglePhase,
    ZPhaseAngle,
    AngleZPhase,
    AnglePhaseZ,
    PhaseZAngle,
    PhaseAngleZ,
}

impl CollectionOrder {
    pub const ALL: [CollectionOrder; 6] = [
        Self::ZAnglePhase,
        Self::ZPhaseAngle,
        Self::AngleZPhase,
        Self::AnglePhaseZ,
        Self::PhaseZAngle,
        Self::PhaseAngleZ,
    ];

    pub fn nesting(self) -> [StackAxis; 3] {
        match self {
            Self::ZAnglePhase => [StackAxis::Z, StackAxis::Angle, StackAxis::Phase],
            Self::ZPhaseAngle => [StackAxis::Z, StackAxis::Phase, StackAxis::Angle],
            Self::AngleZPhase => [StackAxis::Angle, StackAxis::Z, StackAxis::Phase],
            Self::AnglePhaseZ => [StackAxis::Angle, StackAxis::Phase, StackAxis::Z],
            Self::PhaseZAngle => [StackAxis::Phase, StackAxis::Z, StackAxis::Angle],
            Self::PhaseAngleZ => [StackAxis::Phase, StackAxis::Angle, StackAxis::Z],
        }
    }
}

impl fmt::Display for CollectionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .nesting()
            .iter()
            .map(|d| match d {
                StackAxis::Angle => "Angle",
                StackAxis::Phase => "Phase",
                StackAxis::Z => "Z",
            })
            .collect();
        write!(f, "{}", names.join(", "))
    }
}

impl FromStr for CollectionOrder {
    type Err = CockpitError;

    /// Accepts the display form ("Z, Angle, Phase") and the snake case form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|order| {
                let name: String = order
                    .to_string()
                    .chars()
                    .filter(|c| c.is_ascii_alphabetic())
                    .collect();
                name.to_ascii_lowercase() == wanted
            })
            .ok_or_else(|| CockpitError::Configuration(format!("unknown collection order '{s}'")))
    }
}

/// One image set: pattern angle and phase indices and the Z altitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiPosition {
    pub angle: usize,
    pub phase: usize,
    pub z: f64,
}

pub struct StructuredIllumination {
    pub order: CollectionOrder,
    pub num_angles: usize,
    pub num_phases: usize,
    /// Extra exposure per angle index, by light name: an exposure `t` at
    /// angle `a` becomes `t * (1 + comp * a)`.
    pub bleach_compensation: HashMap<String, f64>,
    pub angle: Option<Arc<dyn Positioner>>,
    pub phase: Option<Arc<dyn Positioner>>,
    pub polarizer: Option<Arc<dyn Positioner>>,
    /// Pattern generator advanced by one toggle per exposure.
    pub pattern_trigger: Option<HandlerRef>,
}

impl Default for StructuredIllumination {
    fn default() -> Self {
        Self {
            order: CollectionOrder::default(),
            num_angles: 3,
            num_phases: 5,
            bleach_compensation: HashMap::new(),
            angle: None,
            phase: None,
            polarizer: None,
            pattern_trigger: None,
        }
    }
}

fn indexed(index: usize) -> ActionParam {
    ActionParam::Indexed {
        index,
        wavelength: None,
    }
}

impl StructuredIllumination {
    /// Every image set in acquisition order.
    pub fn positions(
        &self,
        num_z_slices: usize,
        z_start: f64,
        slice_height: f64,
    ) -> Vec<SiPosition> {
        let nesting = self.order.nesting();
        let extent = |dim: StackAxis| match dim {
            StackAxis::Angle => self.num_angles,
            StackAxis::Phase => self.num_phases,
            StackAxis::Z => num_z_slices,
        };
        let mut positions = Vec::with_capacity(self.num_angles * self.num_phases * num_z_slices);
        for i in 0..extent(nesting[0]) {
            for j in 0..extent(nesting[1]) {
                for k in 0..extent(nesting[2]) {
                    let mut position = SiPosition {
                        angle: 0,
                        phase: 0,
                        z: z_start,
                    };
                    for (dim, value) in nesting.iter().zip([i, j, k]) {
                        match dim {
                            StackAxis::Angle => position.angle = value,
                            StackAxis::Phase => position.phase = value,
                            StackAxis::Z => position.z = z_start + slice_height * value as f64,
                        }
                    }
                    positions.push(position);
                }
            }
        }
        positions
    }

    fn handler(
        positioner: &Option<Arc<dyn Positioner>>,
    ) -> Option<(Arc<dyn Positioner>, HandlerRef)> {
        positioner
            .as_ref()
            .map(|p| (Arc::clone(p), HandlerRef::from(Arc::clone(p))))
    }

    /// Expose one setting with bleach-compensated light times, after moving
    /// the polariser and advancing the pattern.
    fn expose(
        &self,
        ctx: &mut GenerationContext<'_>,
        cur: TimeMs,
        setting: &ExposureSetting,
        position: SiPosition,
        table: &mut ActionTable,
    ) -> CockpitResult<TimeMs> {
        // The pattern is tuned for the longest wavelength in the exposure.
        let mut longest_wavelength: Option<f64> = None;
        let mut lights = Vec::with_capacity(setting.lights.len());
        for exposure in &setting.lights {
            let wavelength = if exposure.light.is_ambient() {
                Some(AMBIENT_WAVELENGTH)
            } else {
                exposure.light.wavelength()
            };
            if let Some(wl) = wavelength {
                longest_wavelength = Some(longest_wavelength.map_or(wl, |l: f64| l.max(wl)));
            }
            let comp = self
                .bleach_compensation
                .get(exposure.light.name())
                .copied()
                .unwrap_or(0.0);
            let time = exposure.time.scale(1.0 + comp * position.angle as f64);
            lights.push(LightExposure::new(Arc::clone(&exposure.light), time));
        }

        let mut delay = TimeMs::ZERO;
        if let Some((polarizer, handler)) = Self::handler(&self.polarizer) {
            let last = match table.last_action_for(&handler) {
                Some((_, ActionParam::Indexed { index, .. })) => *index as f64,
                Some((_, ActionParam::Position(p))) => *p,
                _ => 0.0,
            };
            table.add_action(
                cur,
                &handler,
                ActionParam::Indexed {
                    index: position.angle,
                    wavelength: longest_wavelength,
                },
            );
            let (motion, settle) = polarizer.movement_time(last, position.angle as f64)?;
            delay = delay.max(motion + settle);
        }
        if let Some(trigger) = &self.pattern_trigger {
            let end = table.add_toggle(cur, trigger);
            let response = trigger.toggle_route().map_or(TimeMs::ZERO, |r| r.response);
            delay = delay.max(end - cur + response);
        }
        ctx.planner.expose(cur + delay, &setting.cameras, &lights, table)
    }
}

impl ActionGenerator for StructuredIllumination {
    fn name(&self) -> &str {
        "structured illumination"
    }

    fn metadata(&self) -> Option<String> {
        Some(format!("SI order: {}", self.order))
    }

    fn handlers(&self) -> Vec<HandlerRef> {
        [&self.angle, &self.phase, &self.polarizer]
            .into_iter()
            .flatten()
            .map(|p| HandlerRef::from(Arc::clone(p)))
            .chain(self.pattern_trigger.clone())
            .collect()
    }

    /// Put each saved file's stack into angle, Z, phase order.
    fn finish_files(&self, files: &[PathBuf], params: &ExperimentParams) -> CockpitResult<()> {
        let stack = PackedStack {
            order: self.order.nesting(),
            angles: self.num_angles,
            phases: self.num_phases,
            z_slices: params.num_z_slices(),
        };
        for file in files {
            reorder_stack(file, &stack)?;
        }
        Ok(())
    }

    fn generate_actions(&self, ctx: &mut GenerationContext<'_>) -> CockpitResult<ActionTable> {
        let params = ctx.params;
        let (z_stage, z) = Self::handler(&params.z_positioner).ok_or_else(|| {
            CockpitError::MissingHandler("structured illumination needs a Z positioner".to_string())
        })?;
        let angle = Self::handler(&self.angle);
        let phase = Self::handler(&self.phase);
        let z_start = ctx.z_start;

        let mut table = ActionTable::new();
        let mut cur = TimeMs::ZERO;
        if let Some((_, handler)) = &angle {
            table.add_action(cur, handler, indexed(0));
            cur += NUDGE;
        }
        if let Some((_, handler)) = &phase {
            table.add_action(cur, handler, indexed(0));
            cur += INITIAL_SETTLE;
        }
        table.add_action(cur, &z, ActionParam::Position(z_start));
        cur += INITIAL_SETTLE;
        if let Some(trigger) = &self.pattern_trigger {
            // Bring up the first pattern.
            cur = table.add_toggle(cur, trigger) + PATTERN_SETTLE;
        }

        let positions = self.positions(params.num_z_slices(), z_start, params.slice_height);
        let mut prev: Option<SiPosition> = None;
        for position in &positions {
            let mut settle_delay = TimeMs::ZERO;
            if let Some((_, last)) = table.first_and_last_action_times(true) {
                cur = cur.max(last + NUDGE);
            }

            if let Some(prev) = prev {
                if position.angle != prev.angle {
                    if let Some((positioner, handler)) = &angle {
                        let (motion, settle) =
                            positioner.movement_time(prev.angle as f64, position.angle as f64)?;
                        table.add_action(cur + motion, handler, indexed(position.angle));
                        settle_delay = settle_delay.max(motion + settle);
                    }
                    cur += ORDERING_STEP;
                }
                if position.phase != prev.phase {
                    if let Some((positioner, handler)) = &phase {
                        let (motion, settle) =
                            positioner.movement_time(prev.phase as f64, position.phase as f64)?;
                        hold_then_move(
                            &mut table,
                            handler,
                            cur,
                            motion,
                            indexed(prev.phase),
                            indexed(position.phase),
                        );
                        settle_delay = settle_delay.max(motion + settle);
                    }
                    cur += ORDERING_STEP;
                }
            }
            let prev_z = prev.map(|p| p.z);
            if prev_z != Some(position.z) {
                if let Some(prev_z) = prev_z {
                    let (motion, settle) = z_stage.movement_time(prev_z, position.z)?;
                    hold_then_move(
                        &mut table,
                        &z,
                        cur,
                        motion,
                        ActionParam::Position(prev_z),
                        ActionParam::Position(position.z),
                    );
                    settle_delay = settle_delay.max(motion + settle);
                }
                cur += ORDERING_STEP;
            }
            prev = Some(*position);

            cur += settle_delay;
            for setting in &params.exposure_settings {
                cur = self.expose(ctx, cur, setting, *position, &mut table)?;
            }
            debug!(
                angle = position.angle,
                phase = position.phase,
                z = position.z,
                end = %cur,
                "image set planned"
            );
        }

        // Hold everything to the end, then return to the start for the next
        // repetition.
        let last = prev.unwrap_or(SiPosition {
            angle: 0,
            phase: 0,
            z: z_start,
        });
        let (motion, settle) = z_stage.movement_time(last.z, z_start)?;
        hold_then_move(
            &mut table,
            &z,
            cur,
            motion,
            ActionParam::Position(last.z),
            ActionParam::Position(z_start),
        );
        table.add_action(cur + motion + settle, &z, ActionParam::Position(z_start));

        if let Some((positioner, handler)) = &angle {
            let (motion, _) = positioner.movement_time(last.angle as f64, 0.0)?;
            table.add_action(cur + motion, handler, indexed(0));
        }
        if let Some((positioner, handler)) = &phase {
            let (motion, _) = positioner.movement_time(last.phase as f64, 0.0)?;
            hold_then_move(&mut table, handler, cur, motion, indexed(last.phase), indexed(0));
        }
        if let Some((_, handler)) = Self::handler(&self.polarizer) {
            table.add_action(cur, &handler, indexed(0));
        }
        if let Some(trigger) = &self.pattern_trigger {
            // Back to the first pattern.
            table.add_toggle(cur, trigger);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_nest_outermost_first() {
        let si = StructuredIllumination {
            order: CollectionOrder::ZAnglePhase,
            num_angles: 2,
            num_phases: 3,
            ..Default::default()
        };
        let positions = si.positions(2, 10.0, 0.5);
        assert_eq!(positions.len(), 12);
        assert_eq!(
            positions[..4],
            [
                SiPosition { angle: 0, phase: 0, z: 10.0 },
                SiPosition { angle: 0, phase: 1, z: 10.0 },
                SiPosition { angle: 0, phase: 2, z: 10.0 },
                SiPosition { angle: 1, phase: 0, z: 10.0 },
            ]
        );
        assert_eq!(positions[6].z, 10.5);

        let si = StructuredIllumination {
            order: CollectionOrder::PhaseAngleZ,
            num_angles: 2,
            num_phases: 3,
            ..Default::default()
        };
        let positions = si.positions(2, 0.0, 1.0);
        assert_eq!(positions[1], SiPosition { angle: 0, phase: 0, z: 1.0 });
        assert_eq!(positions[2], SiPosition { angle: 1, phase: 0, z: 0.0 });
    }

    #[test]
    fn order_names_parse_back() {
        for order in CollectionOrder::ALL {
            assert_eq!(order.to_string().parse::<CollectionOrder>().unwrap(), order);
        }
        assert_eq!(
            "z_phase_angle".parse::<CollectionOrder>().unwrap(),
            CollectionOrder::ZPhaseAngle
        );
        assert!("Z, Angle".parse::<CollectionOrder>().is_err());
    }

    #[test]
    fn metadata_names_the_order() {
        let si = StructuredIllumination::default();
        assert_eq!(si.metadata().unwrap(), "SI order: Z, Angle, Phase");
    }
}
