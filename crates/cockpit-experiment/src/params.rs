//! Experiment parameters shared by every strategy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cockpit_core::{
    Camera, CockpitError, CockpitResult, DeviceHandler, HandlerRef, LightSource, Positioner,
    TimeMs,
};

/// How long a light stays on during one exposure.
#[derive(Clone)]
pub struct LightExposure {
    pub light: Arc<dyn LightSource>,
    pub time: TimeMs,
}

impl LightExposure {
    pub fn new(light: Arc<dyn LightSource>, time: TimeMs) -> Self {
        Self { light, time }
    }
}

impl std::fmt::Debug for LightExposure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} for {} ms", self.light.name(), self.time)
    }
}

/// A set of cameras exposed together under a set of lights.
#[derive(Clone, Default)]
pub struct ExposureSetting {
    pub cameras: Vec<Arc<dyn Camera>>,
    pub lights: Vec<LightExposure>,
}

impl ExposureSetting {
    pub fn new(cameras: Vec<Arc<dyn Camera>>, lights: Vec<LightExposure>) -> Self {
        Self { cameras, lights }
    }

    pub fn includes_camera(&self, name: &str) -> bool {
        self.cameras.iter().any(|c| c.name() == name)
    }

    pub fn longest_light(&self) -> TimeMs {
        self.lights.iter().map(|l| l.time).max().unwrap_or(TimeMs::ZERO)
    }
}

impl std::fmt::Debug for ExposureSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposureSetting")
            .field(
                "cameras",
                &self.cameras.iter().map(|c| c.name().to_string()).collect::<Vec<_>>(),
            )
            .field("lights", &self.lights)
            .finish()
    }
}

/// Everything an experiment needs to know before it builds its table.
#[derive(Clone)]
pub struct ExperimentParams {
    pub num_reps: u32,
    /// Time from the start of one repetition to the start of the next.
    /// Zero runs the repetitions back to back.
    pub rep_duration: TimeMs,
    pub z_positioner: Option<Arc<dyn Positioner>>,
    /// Altitude of the bottom of the stack, in µm.
    pub z_bottom: f64,
    /// Height of the stack; zero for a single plane.
    pub z_height: f64,
    pub slice_height: f64,
    pub cameras: Vec<Arc<dyn Camera>>,
    pub lights: Vec<Arc<dyn LightSource>>,
    pub exposure_settings: Vec<ExposureSetting>,
    /// Handlers that take part without being cameras, lights or the Z axis.
    pub other_handlers: Vec<HandlerRef>,
    pub metadata: String,
    pub save_path: Option<PathBuf>,
}

impl Default for ExperimentParams {
    fn default() -> Self {
        Self {
            num_reps: 1,
            rep_duration: TimeMs::ZERO,
            z_positioner: None,
            z_bottom: 0.0,
            z_height: 0.0,
            slice_height: 0.1,
            cameras: Vec::new(),
            lights: Vec::new(),
            exposure_settings: Vec::new(),
            other_handlers: Vec::new(),
            metadata: String::new(),
            save_path: None,
        }
    }
}

impl ExperimentParams {
    /// Number of Z planes, including the top of the volume for 3D stacks.
    pub fn num_z_slices(&self) -> usize {
        if self.slice_height <= 0.0 {
            return 1;
        }
        let mut slices = (self.z_height / self.slice_height).ceil().max(0.0) as usize;
        if self.z_height > 1e-6 {
            slices += 1;
        }
        slices.max(1)
    }

    /// Save path, unless it has no file name component.
    pub fn effective_save_path(&self) -> Option<&PathBuf> {
        self.save_path.as_ref().filter(|p| {
            p.file_name()
                .is_some_and(|name| !name.to_string_lossy().trim().is_empty())
        })
    }

    /// Longest light time any exposure setting asks of `camera`.
    pub fn exposure_time_for_camera(&self, camera: &str) -> TimeMs {
        self.exposure_settings
            .iter()
            .filter(|s| s.includes_camera(camera))
            .map(ExposureSetting::longest_light)
            .max()
            .unwrap_or(TimeMs::ZERO)
    }

    /// Every handler the experiment touches.
    pub fn all_handlers(&self) -> Vec<HandlerRef> {
        let mut handlers: Vec<HandlerRef> = Vec::new();
        let mut push = |handler: HandlerRef| {
            if !handlers.contains(&handler) {
                handlers.push(handler);
            }
        };
        for camera in &self.cameras {
            push(HandlerRef::from(Arc::clone(camera)));
        }
        for light in &self.lights {
            push(HandlerRef::from(Arc::clone(light)));
        }
        for setting in &self.exposure_settings {
            for camera in &setting.cameras {
                push(HandlerRef::from(Arc::clone(camera)));
            }
            for exposure in &setting.lights {
                push(HandlerRef::from(Arc::clone(&exposure.light)));
            }
        }
        if let Some(z) = &self.z_positioner {
            push(HandlerRef::from(Arc::clone(z)));
        }
        for other in &self.other_handlers {
            push(other.clone());
        }
        handlers
    }

    pub fn validate(&self) -> CockpitResult<()> {
        if self.num_reps == 0 {
            return Err(CockpitError::Configuration(
                "an experiment needs at least one repetition".to_string(),
            ));
        }
        if self.rep_duration.is_negative() {
            return Err(CockpitError::Configuration(format!(
                "negative repetition duration {} ms",
                self.rep_duration
            )));
        }
        if self.z_height < 0.0 {
            return Err(CockpitError::Configuration(format!(
                "negative stack height {}",
                self.z_height
            )));
        }
        if self.z_height > 0.0 && self.slice_height <= 0.0 {
            return Err(CockpitError::Configuration(format!(
                "slice height must be positive, got {}",
                self.slice_height
            )));
        }
        if self.z_positioner.is_none() && self.z_height > 0.0 {
            return Err(CockpitError::MissingHandler(
                "a Z positioner is required for a 3D stack".to_string(),
            ));
        }
        if self.exposure_settings.iter().all(|s| s.cameras.is_empty()) {
            return Err(CockpitError::Configuration(
                "no exposure setting uses a camera".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExperimentParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentParams")
            .field("num_reps", &self.num_reps)
            .field("rep_duration", &self.rep_duration)
            .field("z_bottom", &self.z_bottom)
            .field("z_height", &self.z_height)
            .field("slice_height", &self.slice_height)
            .field("exposure_settings", &self.exposure_settings)
            .field("metadata", &self.metadata)
            .field("save_path", &self.save_path)
            .finish_non_exhaustive()
    }
}

/// Runtime knobs that do not change the table.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// How long to wait for an executor to finish a slice. `None` waits
    /// indefinitely.
    pub executor_timeout: Option<Duration>,
    /// Pause after the last repetition so in-flight images can arrive.
    pub post_run_grace: Duration,
    pub saver_idle: Duration,
    pub max_filesize_mb: Option<f64>,
    /// Pixel size in µm, written to the file header.
    pub pixel_size_um: f32,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            executor_timeout: None,
            post_run_grace: Duration::from_secs(1),
            saver_idle: cockpit_storage::DEFAULT_IDLE_TIMEOUT,
            max_filesize_mb: None,
            pixel_size_um: 0.1,
        }
    }
}
