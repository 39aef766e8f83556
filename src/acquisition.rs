//! Turning a command-line request into experiment parameters.

use std::path::PathBuf;
use std::sync::Arc;

use cockpit_core::{
    Camera, CockpitError, CockpitResult, DeviceDepot, HandlerRef, LightSource, Positioner, TimeMs,
};
use cockpit_driver_mock::SimulatedRig;
use cockpit_experiment::{
    ActionGenerator, CollectionOrder, ExperimentParams, ExposureSetting, LightExposure,
    SampleRate, StructuredIllumination, StutteredZStack, SweptShutter, ZStack,
};

use crate::config::StorageConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Strategy {
    #[default]
    #[value(name = "z-stack")]
    ZStack,
    #[value(name = "si")]
    StructuredIllumination,
    #[value(name = "swept")]
    SweptShutter,
    #[value(name = "stuttered")]
    StutteredZStack,
}

/// What to acquire.
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub strategy: Strategy,
    pub num_reps: u32,
    pub rep_duration: TimeMs,
    pub z_bottom: f64,
    pub z_height: f64,
    pub slice_height: f64,
    /// Light time of every exposure.
    pub exposure: TimeMs,
    /// Camera names; empty uses every camera of the rig.
    pub cameras: Vec<String>,
    /// Light names; empty uses every light of the rig.
    pub lights: Vec<String>,
    pub si_order: CollectionOrder,
    pub pattern_trigger: Option<String>,
    /// Intervals a stuttered Z stack cycles through.
    pub sample_rates: Vec<SampleRate>,
    pub metadata: String,
    /// File name under the storage directory; `None` saves nothing.
    pub output: Option<PathBuf>,
}

impl Default for AcquisitionRequest {
    fn default() -> Self {
        Self {
            strategy: Strategy::ZStack,
            num_reps: 1,
            rep_duration: TimeMs::ZERO,
            z_bottom: 0.0,
            z_height: 0.0,
            slice_height: 0.1,
            exposure: TimeMs::from_ms(10),
            cameras: Vec::new(),
            lights: Vec::new(),
            si_order: CollectionOrder::ZAnglePhase,
            pattern_trigger: None,
            sample_rates: Vec::new(),
            metadata: String::new(),
            output: None,
        }
    }
}

fn pick<T: ?Sized>(
    depot: &DeviceDepot,
    names: &[String],
    all: Vec<Arc<T>>,
    cast: impl Fn(&HandlerRef) -> Option<Arc<T>>,
) -> CockpitResult<Vec<Arc<T>>> {
    if names.is_empty() {
        return Ok(all);
    }
    names
        .iter()
        .map(|name| {
            depot
                .get(name)
                .as_ref()
                .and_then(&cast)
                .ok_or_else(|| CockpitError::MissingHandler(name.clone()))
        })
        .collect()
}

impl AcquisitionRequest {
    pub fn params(
        &self,
        rig: &SimulatedRig,
        storage: &StorageConfig,
    ) -> CockpitResult<ExperimentParams> {
        let cameras: Vec<Arc<dyn Camera>> = pick(
            &rig.depot,
            &self.cameras,
            rig.depot.cameras(),
            |h| h.as_camera().cloned(),
        )?;
        let lights: Vec<Arc<dyn LightSource>> = pick(
            &rig.depot,
            &self.lights,
            rig.depot.lights(),
            |h| h.as_light().cloned(),
        )?;
        let exposures = lights
            .iter()
            .map(|light| LightExposure::new(Arc::clone(light), self.exposure))
            .collect();

        Ok(ExperimentParams {
            num_reps: self.num_reps,
            rep_duration: self.rep_duration,
            z_positioner: rig.z_stage.clone().map(|z| z as Arc<dyn Positioner>),
            z_bottom: self.z_bottom,
            z_height: self.z_height,
            slice_height: self.slice_height,
            exposure_settings: vec![ExposureSetting::new(cameras.clone(), exposures)],
            cameras,
            lights,
            other_handlers: Vec::new(),
            metadata: self.metadata.clone(),
            save_path: self.output.as_ref().map(|name| storage.output_dir.join(name)),
        })
    }

    pub fn generator(&self, rig: &SimulatedRig) -> CockpitResult<Box<dyn ActionGenerator>> {
        match self.strategy {
            Strategy::ZStack => Ok(Box::new(ZStack)),
            Strategy::SweptShutter => Ok(Box::new(SweptShutter)),
            Strategy::StutteredZStack => {
                Ok(Box::new(StutteredZStack::new(self.sample_rates.clone())?))
            }
            Strategy::StructuredIllumination => {
                let pattern_trigger = match &self.pattern_trigger {
                    Some(name) => Some(
                        rig.depot
                            .get(name)
                            .ok_or_else(|| CockpitError::MissingHandler(name.clone()))?,
                    ),
                    None => None,
                };
                Ok(Box::new(StructuredIllumination {
                    order: self.si_order,
                    pattern_trigger,
                    ..Default::default()
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cockpit_core::{DeviceHandler, ExposureMode};
    use cockpit_driver_mock::{MockCameraConfig, MockLightConfig, MockStageConfig};
    use cockpit_executor::DigitalAnalogConfig;

    fn rig() -> SimulatedRig {
        let mut cam = MockCameraConfig::new("cam", ExposureMode::TriggerDuration);
        cam.trigger_line = Some(0);
        let mut other = MockCameraConfig::new("other", ExposureMode::TriggerBefore);
        other.trigger_line = Some(1);
        SimulatedRig::builder(DigitalAnalogConfig::new("dsp"))
            .camera(cam)
            .camera(other)
            .light(MockLightConfig::new("488", 488.0))
            .z_stage(MockStageConfig::new("z", 0.0, 100.0))
            .build()
            .unwrap()
    }

    fn storage() -> StorageConfig {
        StorageConfig {
            output_dir: PathBuf::from("/data"),
            max_filesize_mb: None,
        }
    }

    #[test]
    fn empty_selection_uses_every_device() {
        let rig = rig();
        let request = AcquisitionRequest {
            output: Some(PathBuf::from("run.dv")),
            ..Default::default()
        };
        let params = request.params(&rig, &storage()).unwrap();
        assert_eq!(params.cameras.len(), 2);
        assert_eq!(params.exposure_settings[0].lights.len(), 1);
        assert_eq!(params.save_path, Some(PathBuf::from("/data/run.dv")));
        assert!(params.z_positioner.is_some());
    }

    #[test]
    fn named_cameras_are_looked_up() {
        let rig = rig();
        let request = AcquisitionRequest {
            cameras: vec!["other".to_string()],
            ..Default::default()
        };
        let params = request.params(&rig, &storage()).unwrap();
        assert_eq!(params.cameras.len(), 1);
        assert_eq!(params.cameras[0].name(), "other");

        let missing = AcquisitionRequest {
            cameras: vec!["488".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            missing.params(&rig, &storage()),
            Err(CockpitError::MissingHandler(name)) if name == "488"
        ));
    }

    #[test]
    fn unknown_pattern_trigger_is_missing() {
        let rig = rig();
        let request = AcquisitionRequest {
            strategy: Strategy::StructuredIllumination,
            pattern_trigger: Some("slm".to_string()),
            ..Default::default()
        };
        assert!(request.generator(&rig).is_err());
        let plain = AcquisitionRequest {
            strategy: Strategy::StructuredIllumination,
            ..Default::default()
        };
        assert_eq!(plain.generator(&rig).unwrap().name(), "structured illumination");
    }

    #[test]
    fn stuttered_stack_needs_sample_rates() {
        let rig = rig();
        let mut request = AcquisitionRequest {
            strategy: Strategy::StutteredZStack,
            ..Default::default()
        };
        assert!(request.generator(&rig).unwrap_err().is_configuration());
        request.sample_rates = vec![SampleRate {
            interval: TimeMs::from_ms(50),
            num_reps: 4,
        }];
        let generator = request.generator(&rig).unwrap();
        assert_eq!(generator.name(), "stuttered z-stack");
        assert_eq!(generator.rep_blocks(6, TimeMs::ZERO).len(), 2);
    }
}
