//! A complete simulated microscope wired to one executor board.
//!
//! Cameras and lights with a trigger line are registered as digital clients
//! of the executor and attached to the simulated board, so a table run on
//! the executor drives them. The Z stage is moved in software.

use std::sync::Arc;

use cockpit_core::{
    Camera, CockpitResult, DeviceDepot, DeviceHandler, EventBus, Executor, LightSource,
    Positioner, RunContext, TimeMs,
};
use cockpit_executor::{
    AnalogLineConfig, AnalogLineHandler, DelegatedTrigger, DigitalAnalogConfig,
    DigitalAnalogExecutor, ExecutorBackend,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::{ErrorConfig, MockMode};
use crate::mock_camera::{MockCamera, MockCameraConfig};
use crate::mock_executor_backend::{MockExecutorBackend, TriggerListener};
use crate::mock_light::{MockLight, MockLightConfig};
use crate::mock_stage::{MockStage, MockStageConfig};

/// A device triggered through one of the executor's lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegatedTriggerConfig {
    pub name: String,
    pub line: u32,
    pub trigger_time: TimeMs,
    #[serde(default)]
    pub response_time: TimeMs,
}

pub struct SimulatedRig {
    pub bus: Arc<EventBus>,
    pub depot: Arc<DeviceDepot>,
    pub executor: Arc<DigitalAnalogExecutor>,
    pub backend: Arc<MockExecutorBackend>,
    pub cameras: Vec<Arc<MockCamera>>,
    pub lights: Vec<Arc<MockLight>>,
    pub z_stage: Option<Arc<MockStage>>,
    pub analog: Vec<Arc<AnalogLineHandler>>,
    pub delegated: Vec<Arc<DelegatedTrigger>>,
}

impl SimulatedRig {
    pub fn builder(executor: DigitalAnalogConfig) -> SimulatedRigBuilder {
        SimulatedRigBuilder {
            bus: Arc::new(EventBus::new()),
            mode: MockMode::default(),
            errors: ErrorConfig::none(),
            executor,
            cameras: Vec::new(),
            lights: Vec::new(),
            z_stage: None,
            analog: Vec::new(),
            delegated: Vec::new(),
        }
    }

    pub fn context(&self) -> RunContext {
        RunContext::new(Arc::clone(&self.depot), Arc::clone(&self.bus))
    }

    pub fn camera(&self, name: &str) -> Option<Arc<MockCamera>> {
        self.cameras.iter().find(|c| c.name() == name).cloned()
    }

    pub fn light(&self, name: &str) -> Option<Arc<MockLight>> {
        self.lights.iter().find(|l| l.name() == name).cloned()
    }
}

/// Builder for [`SimulatedRig`]
pub struct SimulatedRigBuilder {
    bus: Arc<EventBus>,
    mode: MockMode,
    errors: ErrorConfig,
    executor: DigitalAnalogConfig,
    cameras: Vec<MockCameraConfig>,
    lights: Vec<MockLightConfig>,
    z_stage: Option<MockStageConfig>,
    analog: Vec<AnalogLineConfig>,
    delegated: Vec<DelegatedTriggerConfig>,
}

impl SimulatedRigBuilder {
    /// Share an existing bus instead of creating one.
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Error injection for the executor board.
    pub fn executor_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    pub fn camera(mut self, config: MockCameraConfig) -> Self {
        self.cameras.push(config);
        self
    }

    pub fn light(mut self, config: MockLightConfig) -> Self {
        self.lights.push(config);
        self
    }

    pub fn z_stage(mut self, config: MockStageConfig) -> Self {
        self.z_stage = Some(config);
        self
    }

    pub fn analog_line(mut self, config: AnalogLineConfig) -> Self {
        self.analog.push(config);
        self
    }

    pub fn delegated_trigger(mut self, config: DelegatedTriggerConfig) -> Self {
        self.delegated.push(config);
        self
    }

    pub fn build(self) -> CockpitResult<SimulatedRig> {
        let depot = Arc::new(DeviceDepot::new());
        let backend = MockExecutorBackend::with_errors(
            self.executor.name.clone(),
            self.executor.alines,
            self.mode,
            self.errors,
        );
        let executor = DigitalAnalogExecutor::new(
            self.executor,
            Arc::clone(&backend) as Arc<dyn ExecutorBackend>,
            Arc::clone(&self.bus),
        );
        depot.add(Arc::clone(&executor) as Arc<dyn Executor>)?;

        let mut cameras = Vec::with_capacity(self.cameras.len());
        for config in self.cameras {
            let camera = MockCamera::builder(config, Arc::clone(&self.bus))
                .mode(self.mode)
                .build();
            if let Some(line) = camera.trigger_line() {
                executor.register_digital(camera.name(), line)?;
                backend.attach(line, Arc::clone(&camera) as Arc<dyn TriggerListener>);
            }
            depot.add(Arc::clone(&camera) as Arc<dyn Camera>)?;
            cameras.push(camera);
        }

        let mut lights = Vec::with_capacity(self.lights.len());
        for config in self.lights {
            let light = MockLight::new(config);
            if let Some(line) = light.trigger_line() {
                executor.register_digital(light.name(), line)?;
                backend.attach(line, Arc::clone(&light) as Arc<dyn TriggerListener>);
            }
            depot.add(Arc::clone(&light) as Arc<dyn LightSource>)?;
            lights.push(light);
        }

        let z_stage = match self.z_stage {
            Some(config) => {
                let stage = MockStage::new(config, self.mode)?;
                depot.add(Arc::clone(&stage) as Arc<dyn Positioner>)?;
                Some(stage)
            }
            None => None,
        };

        let mut analog = Vec::with_capacity(self.analog.len());
        for config in &self.analog {
            let handler = executor.register_analog(config)?;
            depot.add(Arc::clone(&handler) as Arc<dyn Positioner>)?;
            analog.push(handler);
        }

        let mut delegated = Vec::with_capacity(self.delegated.len());
        for config in self.delegated {
            let handler = DelegatedTrigger::delegate_to(
                config.name,
                &executor,
                config.line,
                config.trigger_time,
                config.response_time,
            )?;
            depot.add(Arc::clone(&handler) as Arc<dyn DeviceHandler>)?;
            delegated.push(handler);
        }

        info!(
            cameras = cameras.len(),
            lights = lights.len(),
            mode = ?self.mode,
            "simulated rig ready"
        );
        Ok(SimulatedRig {
            bus: self.bus,
            depot,
            executor,
            backend,
            cameras,
            lights,
            z_stage,
            analog,
            delegated,
        })
    }
}
