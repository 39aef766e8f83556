//! Camera exposure insertion.
//!
//! The planner owns the per-camera bookkeeping used while a table is built:
//! readout times, whether a camera may hold a stray frame, how many images it
//! will produce per repetition and which of those the saver must drop. It is
//! mutated only while the table is generated and is read-only afterwards.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use cockpit_core::{
    ActionParam, ActionTable, Camera, CockpitError, CockpitResult, DeviceHandler, ExposureMode,
    HandlerRef, LightSource, TimeMs,
};
use tracing::debug;

use crate::params::LightExposure;

/// Settle margin between the end of a readout and the next trigger.
pub const CAMERA_SETTLE: TimeMs = TimeMs::from_us(100);
/// Shortest exposure used to clear a camera.
pub const MIN_CLEARING_EXPOSURE: TimeMs = TimeMs::from_us(100);
/// Early start of a pseudoglobal trigger before the readout window.
pub const PSEUDOGLOBAL_SAFETY: TimeMs = TimeMs::from_us(5);
/// Gap left after a camera reset.
pub const RESET_EPSILON: TimeMs = TimeMs::from_ns(1);

#[derive(Debug, Clone)]
struct CameraState {
    mode: ExposureMode,
    readout: TimeMs,
    ready: bool,
    image_count: u32,
    ignored: BTreeSet<u32>,
}

pub struct ExposurePlanner {
    cameras: Vec<Arc<dyn Camera>>,
    state: HashMap<String, CameraState>,
    light_exposures: BTreeMap<String, BTreeSet<TimeMs>>,
}

impl ExposurePlanner {
    /// Read each camera's readout time. A camera that cannot report an
    /// exact readout time fails the whole experiment.
    pub fn new(cameras: &[Arc<dyn Camera>]) -> CockpitResult<Self> {
        let mut state = HashMap::new();
        for camera in cameras {
            let readout = camera.time_between_exposures()?;
            debug!(camera = %camera.name(), %readout, "readout time");
            state.insert(
                camera.name().to_string(),
                CameraState {
                    mode: camera.exposure_mode(),
                    readout,
                    ready: true,
                    image_count: 0,
                    ignored: BTreeSet::new(),
                },
            );
        }
        Ok(Self {
            cameras: cameras.to_vec(),
            state,
            light_exposures: BTreeMap::new(),
        })
    }

    /// Frame-transfer cameras may hold a frame exposed before the run, so
    /// the first exposure clears them first.
    pub fn mark_frame_transfer_unready(&mut self) {
        for state in self.state.values_mut() {
            if state.mode == ExposureMode::TriggerAfter {
                state.ready = false;
            }
        }
    }

    fn state(&self, camera: &str) -> CockpitResult<&CameraState> {
        self.state
            .get(camera)
            .ok_or_else(|| not_in_experiment(camera))
    }

    fn state_mut(&mut self, camera: &str) -> CockpitResult<&mut CameraState> {
        self.state
            .get_mut(camera)
            .ok_or_else(|| not_in_experiment(camera))
    }

    pub fn cameras(&self) -> &[Arc<dyn Camera>] {
        &self.cameras
    }

    pub fn is_ready(&self, camera: &str) -> bool {
        self.state.get(camera).is_some_and(|s| s.ready)
    }

    /// Images `camera` takes per repetition, discarded ones included.
    pub fn image_count(&self, camera: &str) -> u32 {
        self.state.get(camera).map_or(0, |s| s.image_count)
    }

    /// 1-based indices, within a repetition, of the images to drop.
    pub fn ignored_images(&self, camera: &str) -> BTreeSet<u32> {
        self.state
            .get(camera)
            .map(|s| s.ignored.clone())
            .unwrap_or_default()
    }

    pub fn readout(&self, camera: &str) -> TimeMs {
        self.state.get(camera).map_or(TimeMs::ZERO, |s| s.readout)
    }

    /// Light name to the distinct exposure times it was used with.
    pub fn light_exposures(&self) -> &BTreeMap<String, BTreeSet<TimeMs>> {
        &self.light_exposures
    }

    /// Earliest time `camera` can start its next exposure given what is
    /// already in `table`.
    pub fn time_when_camera_can_expose(
        &self,
        table: &ActionTable,
        camera: &Arc<dyn Camera>,
    ) -> CockpitResult<TimeMs> {
        let handler = HandlerRef::from(Arc::clone(camera));
        let Some((last, _)) = table.last_action_for(&handler) else {
            return Ok(TimeMs::ZERO);
        };
        let state = self.state(camera.name())?;
        let mut next = last;
        if state.mode == ExposureMode::TriggerBefore {
            next += camera.exposure_time();
        }
        Ok(next + state.readout + CAMERA_SETTLE)
    }

    /// Take and discard one image on each camera so that none carries stray
    /// light into the next real exposure. Returns the time the resets end.
    pub fn reset_cams(
        &mut self,
        cur: TimeMs,
        cameras: &[Arc<dyn Camera>],
        table: &mut ActionTable,
    ) -> CockpitResult<TimeMs> {
        let mut reset_end = cur;
        for camera in cameras {
            let start = cur.max(self.time_when_camera_can_expose(table, camera)?);
            let exposure = MIN_CLEARING_EXPOSURE
                .max(camera.min_exposure_time())
                .max(camera.exposure_time());
            let handler = HandlerRef::from(Arc::clone(camera));
            let state = self.state_mut(camera.name())?;
            match state.mode {
                ExposureMode::TriggerAfter => {
                    table.add_toggle(start + exposure, &handler);
                }
                ExposureMode::TriggerDuration | ExposureMode::TriggerDurationPseudoGlobal => {
                    table.add_action(start, &handler, ActionParam::Digital(true));
                    table.add_action(start + exposure, &handler, ActionParam::Digital(false));
                }
                ExposureMode::TriggerSoft => {
                    table.add_action(start, &handler, ActionParam::Digital(true));
                }
                ExposureMode::TriggerBefore => {
                    table.add_toggle(start, &handler);
                }
            }
            reset_end = reset_end.max(start + exposure);
            state.image_count += 1;
            state.ignored.insert(state.image_count);
            state.ready = true;
            debug!(camera = %camera.name(), image = state.image_count, "camera reset");
        }
        Ok(reset_end + RESET_EPSILON)
    }

    /// Insert one exposure of `cameras` under `lights` no earlier than
    /// `cur`. Returns the time the exposure ends.
    pub fn expose(
        &mut self,
        cur: TimeMs,
        cameras: &[Arc<dyn Camera>],
        lights: &[LightExposure],
        table: &mut ActionTable,
    ) -> CockpitResult<TimeMs> {
        let mut cur = cur;
        let unready: Vec<Arc<dyn Camera>> = cameras
            .iter()
            .filter(|c| !self.is_ready(c.name()))
            .cloned()
            .collect();
        if !unready.is_empty() {
            cur = self.reset_cams(cur, &unready, table)?;
        }

        let mut start = cur;
        for camera in cameras {
            start = start.max(self.time_when_camera_can_expose(table, camera)?);
        }

        let mut longest = lights.iter().map(|l| l.time).max().unwrap_or(TimeMs::ZERO);
        for camera in cameras {
            longest = longest.max(camera.min_exposure_time());
            if camera.exposure_mode() == ExposureMode::TriggerAfter {
                // The next trigger ends this exposure, so it must not come
                // before the previous frame has been read out.
                let next_ready = self.time_when_camera_can_expose(table, camera)?;
                longest = longest.max(next_ready - start);
            }
        }
        let end = start + longest;

        for exposure in lights {
            if !exposure.light.is_ambient() {
                let handler = HandlerRef::from(Arc::clone(&exposure.light));
                let offset = (longest - exposure.time).half();
                let start = end - exposure.time - offset;
                table.add_action(start, &handler, ActionParam::Digital(true));
                table.add_action(end - offset, &handler, ActionParam::Digital(false));
            }
            self.light_exposures
                .entry(exposure.light.name().to_string())
                .or_default()
                .insert(exposure.time);
        }

        for camera in cameras {
            let handler = HandlerRef::from(Arc::clone(camera));
            let state = self.state_mut(camera.name())?;
            match state.mode {
                ExposureMode::TriggerAfter => {
                    table.add_toggle(end, &handler);
                }
                ExposureMode::TriggerDuration => {
                    table.add_action(start, &handler, ActionParam::Digital(true));
                    table.add_action(end, &handler, ActionParam::Digital(false));
                }
                ExposureMode::TriggerDurationPseudoGlobal => {
                    let trigger = start - state.readout - PSEUDOGLOBAL_SAFETY;
                    table.add_action(trigger, &handler, ActionParam::Digital(true));
                    table.add_action(end, &handler, ActionParam::Digital(false));
                }
                ExposureMode::TriggerSoft => {
                    table.add_action(start, &handler, ActionParam::Digital(true));
                }
                ExposureMode::TriggerBefore => {
                    table.add_toggle(start, &handler);
                }
            }
            state.image_count += 1;
        }

        for (name, state) in self.state.iter_mut() {
            let exposing = cameras.iter().any(|c| c.name() == name);
            if state.mode == ExposureMode::TriggerAfter && !exposing {
                state.ready = false;
            }
        }

        Ok(end)
    }
}

fn not_in_experiment(camera: &str) -> CockpitError {
    CockpitError::MissingHandler(format!("camera '{camera}' is not part of this experiment"))
}

impl std::fmt::Debug for ExposurePlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposurePlanner")
            .field("state", &self.state)
            .field("light_exposures", &self.light_exposures)
            .finish()
    }
}
