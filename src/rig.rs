//! Assembling the simulated rig described by the configuration.

use cockpit_core::CockpitResult;
use cockpit_driver_mock::SimulatedRig;
use tracing::info;

use crate::config::RigConfig;

/// Build every device of `config` and run their second-stage
/// initialisation.
pub async fn assemble(config: &RigConfig) -> CockpitResult<SimulatedRig> {
    let mut builder = SimulatedRig::builder(config.executor.clone()).mode(config.mode);
    for camera in &config.cameras {
        builder = builder.camera(camera.clone());
    }
    for light in &config.lights {
        builder = builder.light(light.clone());
    }
    if let Some(stage) = &config.z_stage {
        builder = builder.z_stage(stage.clone());
    }
    for analog in &config.analog {
        builder = builder.analog_line(analog.clone());
    }
    for delegated in &config.delegated {
        builder = builder.delegated_trigger(delegated.clone());
    }
    let rig = builder.build()?;
    rig.depot.finalize_initialization(config.init_width).await?;
    info!(handlers = rig.depot.all().len(), "rig assembled");
    Ok(rig)
}
