//! Config to rig to experiment, the way the binary drives it.

use std::path::PathBuf;

use cockpit::acquisition::{AcquisitionRequest, Strategy};
use cockpit::config::CockpitConfig;
use cockpit::core::TimeMs;
use cockpit::experiment::Experiment;
use cockpit::rig;
use cockpit::storage::DvHeader;

fn config(output_dir: &std::path::Path) -> CockpitConfig {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/cockpit.toml");
    let mut config = CockpitConfig::load_from(path).unwrap();
    config.storage.output_dir = output_dir.to_path_buf();
    config.experiment.post_run_grace_ms = 0;
    config.experiment.saver_idle_ms = 100;
    for camera in &mut config.rig.cameras {
        camera.width = 16;
        camera.height = 16;
    }
    config
}

#[tokio::test]
async fn zstack_from_config_writes_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    config.validate().unwrap();
    let rig = rig::assemble(&config.rig).await.unwrap();
    let ctx = rig.context();

    let request = AcquisitionRequest {
        z_bottom: 10.0,
        z_height: 0.2,
        slice_height: 0.1,
        exposure: TimeMs::from_ms(2),
        lights: vec!["488".to_string()],
        metadata: "config driven".to_string(),
        output: Some(PathBuf::from("stack.dv")),
        ..Default::default()
    };
    let mut experiment = Experiment::new(
        request.params(&rig, &config.storage).unwrap(),
        request.generator(&rig).unwrap(),
    )
    .with_settings(config.execution_settings());

    let outcome = experiment.run(&ctx).await.unwrap();
    let path = dir.path().join("stack.dv");
    assert_eq!(outcome.files, vec![path.clone()]);

    let bytes = std::fs::read(&path).unwrap();
    let header = DvHeader::from_bytes(&bytes).unwrap();
    assert_eq!(header.num, [16, 16, 3]);
    assert_eq!(header.wave[0], 525);
    assert!(header
        .titles
        .iter()
        .any(|t| t.starts_with("[light source: ") && t.contains("2.000ms")));

    // The stage goes back to where it started.
    let stage = rig.z_stage.as_ref().unwrap();
    assert_eq!(stage.move_history().last(), Some(&50.0));
}

#[tokio::test]
async fn si_plan_routes_pattern_toggles_to_the_trigger_line() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let rig = rig::assemble(&config.rig).await.unwrap();
    let ctx = rig.context();

    let request = AcquisitionRequest {
        strategy: Strategy::StructuredIllumination,
        z_bottom: 20.0,
        exposure: TimeMs::from_ms(1),
        lights: vec!["561".to_string()],
        pattern_trigger: Some("slm".to_string()),
        si_order: "Z, Phase, Angle".parse().unwrap(),
        ..Default::default()
    };
    let experiment = Experiment::new(
        request.params(&rig, &config.storage).unwrap(),
        request.generator(&rig).unwrap(),
    );
    let planned = experiment.plan(&ctx).await.unwrap();
    assert_eq!(planned.planner.image_count("west"), 15);

    let toggles = planned
        .table
        .iter()
        .filter(|action| action.handler.name() == "slm trigger")
        .count();
    // Up and down for each of the 15 images plus the final reset.
    assert_eq!(toggles, 32);
    assert!(ctx.last_experiment().is_none());
}
