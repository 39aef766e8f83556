//! Experiment lifecycle.
//!
//! ```text
//! Constructed -> Prepared -> TableBuilt -> Running (+ Saving) -> CleaningUp -> Done
//! ```
//!
//! Cleanup runs once preparation has started, whether the run succeeded,
//! failed or was aborted.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use cockpit_core::events::{
    CLEANUP_AFTER_EXPERIMENT, EXPERIMENT_COMPLETE, PREPARE_FOR_EXPERIMENT, UPDATE_STATUS_LIGHT,
    USER_ABORT,
};
use cockpit_core::{
    AbortToken, ActionTable, Axis, Camera, CockpitError, CockpitResult, DeviceHandler, DeviceKind,
    EventPayload, Executor, ExperimentRecord, HandlerRef, HardwareContext, LightSource, Positioner,
    RunContext, TimeMs,
};
use cockpit_storage::{DataSaver, SaverCamera};
use tokio::sync::oneshot;
use tracing::{error, info, instrument, warn};

use crate::execute::{ExecutionSummary, Scheduler};
use crate::params::{ExecutionSettings, ExperimentParams};
use crate::planner::ExposurePlanner;
use crate::strategies::{ActionGenerator, GenerationContext};
use crate::titles::{generate_titles, TitleSource};

/// Experiment state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentState {
    /// Built, nothing touched yet
    Constructed,
    /// Handlers are in experiment mode and the stage is at the bottom
    Prepared,
    /// Action table generated and examined by the executors
    TableBuilt,
    /// Scheduler walking the table
    Running,
    /// Table running while images are written to disk
    Saving,
    /// Restoring handlers and the stage
    CleaningUp,
    /// Finished, successfully or not
    Done,
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentState::Constructed => write!(f, "constructed"),
            ExperimentState::Prepared => write!(f, "prepared"),
            ExperimentState::TableBuilt => write!(f, "table built"),
            ExperimentState::Running => write!(f, "running"),
            ExperimentState::Saving => write!(f, "saving"),
            ExperimentState::CleaningUp => write!(f, "cleaning up"),
            ExperimentState::Done => write!(f, "done"),
        }
    }
}

/// A table together with the bookkeeping used to build it.
#[derive(Debug)]
pub struct PlannedTable {
    pub table: ActionTable,
    pub planner: ExposurePlanner,
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct ExperimentOutcome {
    pub summary: ExecutionSummary,
    pub files: Vec<PathBuf>,
    pub table_len: usize,
    pub table_duration: TimeMs,
}

pub struct Experiment {
    params: ExperimentParams,
    generator: Box<dyn ActionGenerator>,
    settings: ExecutionSettings,
    state: ExperimentState,
}

impl Experiment {
    pub fn new(params: ExperimentParams, generator: Box<dyn ActionGenerator>) -> Self {
        Self {
            params,
            generator,
            settings: ExecutionSettings::default(),
            state: ExperimentState::Constructed,
        }
    }

    pub fn with_settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn state(&self) -> ExperimentState {
        self.state
    }

    pub fn params(&self) -> &ExperimentParams {
        &self.params
    }

    fn set_state(&mut self, state: ExperimentState) {
        info!(from = %self.state, to = %state, "experiment state");
        self.state = state;
    }

    fn handlers(&self) -> Vec<HandlerRef> {
        let mut handlers = self.params.all_handlers();
        for handler in self.generator.handlers() {
            if !handlers.contains(&handler) {
                handlers.push(handler);
            }
        }
        handlers
    }

    /// Every camera the experiment exposes, without duplicates.
    fn cameras(&self) -> Vec<Arc<dyn Camera>> {
        self.handlers()
            .iter()
            .filter_map(|h| h.as_camera().cloned())
            .collect()
    }

    fn metadata(&self) -> String {
        match (self.params.metadata.is_empty(), self.generator.metadata()) {
            (_, None) => self.params.metadata.clone(),
            (true, Some(extra)) => extra,
            (false, Some(extra)) => format!("{}; {extra}", self.params.metadata),
        }
    }

    fn check_environment(&self) -> CockpitResult<()> {
        self.params.validate()?;
        for handler in self.handlers() {
            if !handler.is_eligible_for_experiments() {
                return Err(CockpitError::Configuration(format!(
                    "handler [{}] is not usable in experiments",
                    handler.name()
                )));
            }
        }
        Ok(())
    }

    async fn set_exposure_times(&self) -> CockpitResult<()> {
        for camera in self.cameras() {
            let exposure = self.params.exposure_time_for_camera(camera.name());
            if exposure > TimeMs::ZERO {
                camera
                    .set_exposure_time(exposure)
                    .await
                    .on_device(camera.name())?;
            }
        }
        Ok(())
    }

    /// Put every handler into experiment mode and move to the bottom of the
    /// stack. Returns the altitude the stack starts from.
    async fn prepare_handlers(&self, ctx: &RunContext) -> CockpitResult<f64> {
        let mut z_start = self.params.z_bottom;
        if let Some(z) = &self.params.z_positioner {
            z.wait_settled().await.on_device(z.name())?;
            z.move_absolute(self.params.z_bottom).await.on_device(z.name())?;
            z.wait_settled().await.on_device(z.name())?;
            z_start = z.position().await.on_device(z.name())?;
        }
        ctx.bus().publish(PREPARE_FOR_EXPERIMENT, EventPayload::None);
        for handler in self.handlers() {
            handler
                .prepare_for_experiment()
                .await
                .on_device(handler.name())?;
        }
        for executor in ctx.depot().executors() {
            executor
                .prepare_for_experiment()
                .await
                .on_device(executor.name())?;
        }
        self.set_exposure_times().await?;
        Ok(z_start)
    }

    /// Generate, sort, let the executors rewrite, sort again and shift to
    /// non-negative times.
    pub fn build_table(&self, ctx: &RunContext, z_start: f64) -> CockpitResult<PlannedTable> {
        let mut planner = ExposurePlanner::new(&self.cameras())?;
        planner.mark_frame_transfer_unready();
        let mut generation = GenerationContext {
            params: &self.params,
            planner: &mut planner,
            z_start,
        };
        let mut table = self.generator.generate_actions(&mut generation)?;
        table.sort();
        for executor in ctx.depot().executors() {
            executor.examine_actions(&mut table)?;
        }
        table.clear_bad_entries();
        table.sort();
        table.enforce_positive_timepoints();
        table.refresh_extrema();
        Ok(PlannedTable { table, planner })
    }

    /// Build the table without running anything but the camera exposure
    /// setup.
    pub async fn plan(&self, ctx: &RunContext) -> CockpitResult<PlannedTable> {
        self.check_environment()?;
        self.set_exposure_times().await?;
        self.build_table(ctx, self.params.z_bottom)
    }

    async fn stage_position(&self, ctx: &RunContext) -> CockpitResult<Vec<f64>> {
        let mut stages: Vec<_> = ctx
            .depot()
            .positioners()
            .into_iter()
            .filter(|p| p.kind() == DeviceKind::StagePositioner && p.axis() != Axis::None)
            .collect();
        stages.sort_by_key(|p| match p.axis() {
            Axis::X => 0,
            Axis::Y => 1,
            _ => 2,
        });
        let mut position = Vec::with_capacity(stages.len());
        for stage in stages {
            position.push(stage.position().await.on_device(stage.name())?);
        }
        Ok(position)
    }

    async fn build_saver(
        &self,
        ctx: &RunContext,
        path: PathBuf,
        planned: &PlannedTable,
    ) -> CockpitResult<Option<DataSaver>> {
        let cameras = self.cameras();
        let saver_cameras: Vec<SaverCamera> = cameras
            .iter()
            .map(|camera| {
                let (width, height) = camera.image_size();
                // With several lights on one camera the longest wavelength
                // is the excitation one; shorter ones pump.
                let excitation = self
                    .params
                    .exposure_settings
                    .iter()
                    .filter(|s| s.includes_camera(camera.name()))
                    .flat_map(|s| s.lights.iter().filter_map(|l| l.light.wavelength()))
                    .fold(None, |acc: Option<f64>, wl| Some(acc.map_or(wl, |a| a.max(wl))));
                SaverCamera {
                    name: camera.name().to_string(),
                    width,
                    height,
                    images_per_rep: planned.planner.image_count(camera.name()),
                    ignored: planned.planner.ignored_images(camera.name()),
                    excitation,
                    emission: camera.wavelength(),
                }
            })
            .collect();
        if saver_cameras.iter().all(|c| c.kept_per_rep() == 0) {
            warn!("no camera keeps any image, nothing to save");
            return Ok(None);
        }

        let position = self.stage_position(ctx).await?;
        let metadata = self.metadata();
        let handlers = self.handlers();
        let lights: Vec<_> = handlers.iter().filter_map(|h| h.as_light().cloned()).collect();
        let titles = generate_titles(&TitleSource {
            when: Local::now(),
            position: &position,
            metadata: &metadata,
            handlers: &handlers,
            lights: &lights,
            depot: ctx.depot(),
            light_exposures: planned.planner.light_exposures(),
        })?;

        let mut saver = DataSaver::builder()
            .save_path(path)
            .cameras(saver_cameras)
            .num_reps(self.params.num_reps)
            .max_filesize_mb(self.settings.max_filesize_mb)
            .pixel_size(self.settings.pixel_size_um, self.params.slice_height as f32)
            .titles(titles)
            .idle_timeout(self.settings.saver_idle)
            .build()?;
        saver.start_collecting(ctx.bus());
        Ok(Some(saver))
    }

    /// Build the table, start saving if asked to and run every repetition.
    async fn build_and_execute(
        &mut self,
        ctx: &RunContext,
        z_start: f64,
    ) -> CockpitResult<ExperimentOutcome> {
        let planned = self.build_table(ctx, z_start)?;
        self.set_state(ExperimentState::TableBuilt);
        let table_len = planned.table.len();
        let table_duration = planned.table.duration();
        info!(lines = table_len, duration = %table_duration, "action table ready");
        let blocks = self
            .generator
            .rep_blocks(self.params.num_reps, self.params.rep_duration);
        for block in &blocks {
            if block.num_reps > 1
                && block.rep_duration > TimeMs::ZERO
                && block.rep_duration < table_duration
            {
                warn!(
                    rep_duration = %block.rep_duration,
                    table = %table_duration,
                    "repeat duration is shorter than one repetition, repeats run back to back"
                );
            }
        }

        let saver = match self.params.effective_save_path() {
            Some(path) => self.build_saver(ctx, path.clone(), &planned).await?,
            None => None,
        };
        let files: Vec<PathBuf> = saver
            .as_ref()
            .map(|s| s.filenames().to_vec())
            .unwrap_or_default();

        let abort = AbortToken::new();
        let abort_sub = {
            let abort = abort.clone();
            ctx.bus().subscribe(USER_ABORT, move |_| abort.abort())
        };

        let table = Arc::new(planned.table);
        let executors = ctx.depot().executors();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let run_task = {
            let table = Arc::clone(&table);
            let bus = Arc::clone(ctx.bus());
            let abort = abort.clone();
            let settings = self.settings.clone();
            tokio::spawn(async move {
                let scheduler = Scheduler::new(&table, &executors, &bus, &abort, &settings);
                let result: CockpitResult<ExecutionSummary> = async {
                    let mut summary = ExecutionSummary::default();
                    for block in blocks {
                        let part = scheduler.run(block.num_reps, block.rep_duration).await?;
                        summary.absorb(&part);
                        if summary.aborted {
                            break;
                        }
                    }
                    Ok(summary)
                }
                .await;
                let _ = done_tx.send(());
                result
            })
        };
        self.set_state(ExperimentState::Running);

        let saved = match saver {
            Some(saver) => {
                self.set_state(ExperimentState::Saving);
                Some(
                    saver
                        .execute_and_save(async {
                            let _ = done_rx.await;
                        })
                        .await,
                )
            }
            None => None,
        };

        let summary = run_task
            .await
            .map_err(|e| CockpitError::hardware("scheduler", anyhow::anyhow!(e)));
        ctx.bus().unsubscribe(USER_ABORT, abort_sub);
        let summary = summary??;
        let files = match saved {
            Some(result) => result?,
            None => files,
        };
        if !files.is_empty() {
            self.generator.finish_files(&files, &self.params)?;
        }

        Ok(ExperimentOutcome {
            summary,
            files,
            table_len,
            table_duration,
        })
    }

    /// Release handlers, restore the stage and announce the end of the run.
    async fn cleanup(&self, ctx: &RunContext, initial_z: Option<f64>) -> CockpitResult<()> {
        let mut first_error: Option<CockpitError> = None;
        for handler in self.handlers() {
            if let Err(e) = handler.cleanup_after_experiment().await {
                error!(handler = %handler.name(), error = %e, "cleanup failed");
                first_error.get_or_insert(CockpitError::hardware(handler.name(), e));
            }
        }
        for executor in ctx.depot().executors() {
            if let Err(e) = executor.cleanup_after_experiment().await {
                error!(executor = %executor.name(), error = %e, "cleanup failed");
                first_error.get_or_insert(CockpitError::hardware(executor.name(), e));
            }
        }
        ctx.bus().publish(CLEANUP_AFTER_EXPERIMENT, EventPayload::None);
        if let (Some(z), Some(altitude)) = (&self.params.z_positioner, initial_z) {
            if let Err(e) = z.move_absolute(altitude).await {
                error!(stage = %z.name(), altitude, error = %e, "could not restore altitude");
                first_error.get_or_insert(CockpitError::hardware(z.name(), e));
            }
        }
        ctx.bus().publish(EXPERIMENT_COMPLETE, EventPayload::None);
        ctx.bus().publish(
            UPDATE_STATUS_LIGHT,
            EventPayload::Status {
                light: "device waiting".to_string(),
                text: String::new(),
            },
        );
        first_error.map_or(Ok(()), Err)
    }

    /// Run the experiment to completion.
    ///
    /// Only one experiment runs per context at a time. A user abort ends the
    /// run early without an error; the outcome reports it.
    #[instrument(skip_all, fields(kind = %self.generator.name(), reps = self.params.num_reps), err)]
    pub async fn run(&mut self, ctx: &RunContext) -> CockpitResult<ExperimentOutcome> {
        let _guard = ctx.begin_run()?;
        self.check_environment()?;

        let initial_z = match &self.params.z_positioner {
            Some(z) => Some(z.position().await.on_device(z.name())?),
            None => None,
        };

        let result = match self.prepare_handlers(ctx).await {
            Ok(z_start) => {
                self.set_state(ExperimentState::Prepared);
                self.build_and_execute(ctx, z_start).await
            }
            Err(e) => Err(e),
        };

        self.set_state(ExperimentState::CleaningUp);
        let cleaned = self.cleanup(ctx, initial_z).await;
        self.set_state(ExperimentState::Done);

        let outcome = result?;
        cleaned?;
        if outcome.summary.aborted {
            warn!(reps = outcome.summary.reps_completed, "experiment aborted");
        }
        ctx.record_experiment(ExperimentRecord {
            kind: self.generator.name().to_string(),
            num_reps: self.params.num_reps,
            table_len: outcome.table_len,
            table_duration: outcome.table_duration,
            files: outcome.files.clone(),
        });
        Ok(outcome)
    }
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("kind", &self.generator.name())
            .field("state", &self.state)
            .field("params", &self.params)
            .finish()
    }
}
