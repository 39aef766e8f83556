//! Running a built table.
//!
//! For each repetition the scheduler walks the table and asks every executor
//! how many contiguous lines it can run from the current index. The longest
//! claim wins:
//!
//! - a claim covering the whole table hands over every repetition at once
//! - no claim at all falls back to a software action (soft camera trigger or
//!   direct stage move) run inline at its due time
//! - anything else is a slice, run with one repetition and awaited on the
//!   "experiment execution" event before the next step
//!
//! Slices and software fallbacks take real time. Before each step the
//! lateness against the step's due time is added to a running delay, which
//! shifts every later due time so intervals between actions are preserved.

use std::sync::Arc;

use cockpit_core::events::EXPERIMENT_EXECUTION;
use cockpit_core::{
    AbortToken, Action, ActionParam, ActionTable, Camera, CockpitError, CockpitResult,
    DeviceHandler, EventBus, Executor, HandlerRef, HardwareContext, Positioner, Released, TimeMs,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::params::ExecutionSettings;

/// What happened while a table ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub reps_completed: u32,
    /// Slices handed to executors, whole-table hand-offs included.
    pub delegations: usize,
    /// Actions run in software.
    pub fallbacks: usize,
    pub aborted: bool,
}

impl ExecutionSummary {
    /// Fold in the summary of a later block of repetitions.
    pub fn absorb(&mut self, later: &ExecutionSummary) {
        self.reps_completed += later.reps_completed;
        self.delegations += later.delegations;
        self.fallbacks += later.fallbacks;
        self.aborted |= later.aborted;
    }
}

/// Walks one table for a number of repetitions.
pub struct Scheduler<'a> {
    table: &'a ActionTable,
    executors: &'a [Arc<dyn Executor>],
    bus: &'a EventBus,
    abort: &'a AbortToken,
    settings: &'a ExecutionSettings,
}

enum Step {
    Continue(usize),
    AllRepsDelegated,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        table: &'a ActionTable,
        executors: &'a [Arc<dyn Executor>],
        bus: &'a EventBus,
        abort: &'a AbortToken,
        settings: &'a ExecutionSettings,
    ) -> Self {
        Self {
            table,
            executors,
            bus,
            abort,
            settings,
        }
    }

    /// Executor claiming the longest run from `index`. Ties go to the
    /// first executor.
    fn best_executor(&self, index: usize) -> (Option<&'a Arc<dyn Executor>>, usize) {
        let mut best: (Option<&'a Arc<dyn Executor>>, usize) = (None, 0);
        for executor in self.executors {
            let len = executor.num_runnable_lines(self.table, index);
            if len > best.1 {
                best = (Some(executor), len);
            }
        }
        best
    }

    #[instrument(skip_all, fields(reps = num_reps, lines = self.table.len()), err)]
    pub async fn run(
        &self,
        num_reps: u32,
        rep_duration: TimeMs,
    ) -> CockpitResult<ExecutionSummary> {
        let mut summary = ExecutionSummary::default();
        let rep_hold = (rep_duration > TimeMs::ZERO).then_some(rep_duration);

        'reps: for rep in 0..num_reps {
            if self.abort.is_aborted() {
                warn!(rep, "abort before repetition");
                summary.aborted = true;
                break;
            }
            let rep_start = Instant::now();
            let mut delay = TimeMs::ZERO;
            let mut index = 0;

            while index < self.table.len() {
                if self.abort.is_aborted() {
                    warn!(rep, index, "cancelling repetition after user abort");
                    summary.aborted = true;
                    break 'reps;
                }
                let Some(action) = self.table.get(index) else {
                    index += 1;
                    continue;
                };
                if index > 0 {
                    // Absorb lateness from slow slices, fallbacks and wake-ups.
                    let due = rep_start + (action.time + delay).as_duration();
                    let now = Instant::now();
                    if now > due {
                        delay += TimeMs::from_duration(now - due);
                    }
                }
                match self
                    .step(index, action, rep_start, delay, num_reps, rep_hold, &mut summary)
                    .await?
                {
                    Step::Continue(next) => index = next,
                    Step::AllRepsDelegated => {
                        summary.aborted = self.abort.is_aborted();
                        if !summary.aborted {
                            summary.reps_completed = num_reps;
                        }
                        break 'reps;
                    }
                }
            }

            summary.reps_completed = rep + 1;
            if let Some(hold) = rep_hold {
                let elapsed = TimeMs::from_duration(rep_start.elapsed());
                if elapsed > hold {
                    warn!(rep, %elapsed, %hold, "repetition overran its duration");
                } else if rep + 1 < num_reps {
                    tokio::time::sleep_until(rep_start + hold.as_duration()).await;
                }
            }
        }

        if !summary.aborted && !self.settings.post_run_grace.is_zero() {
            tokio::time::sleep(self.settings.post_run_grace).await;
        }
        info!(
            reps = summary.reps_completed,
            delegations = summary.delegations,
            fallbacks = summary.fallbacks,
            aborted = summary.aborted,
            "table finished"
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn step(
        &self,
        index: usize,
        action: &Action,
        rep_start: Instant,
        delay: TimeMs,
        num_reps: u32,
        rep_hold: Option<TimeMs>,
        summary: &mut ExecutionSummary,
    ) -> CockpitResult<Step> {
        let (executor, len) = self.best_executor(index);
        let due = rep_start + (action.time + delay).as_duration();

        match executor {
            Some(executor) if len == self.table.len() => {
                info!(executor = %executor.name(), num_reps, "executor takes the whole table");
                self.delegate(executor, index, len, num_reps, rep_hold).await?;
                summary.delegations += 1;
                Ok(Step::AllRepsDelegated)
            }
            Some(executor) => {
                tokio::time::sleep_until(due).await;
                debug!(executor = %executor.name(), index, len, "running slice");
                self.delegate(executor, index, index + len, 1, None).await?;
                summary.delegations += 1;
                Ok(Step::Continue(index + len))
            }
            None => {
                tokio::time::sleep_until(due).await;
                self.fallback(index, action).await?;
                summary.fallbacks += 1;
                Ok(Step::Continue(index + 1))
            }
        }
    }

    async fn delegate(
        &self,
        executor: &Arc<dyn Executor>,
        start: usize,
        stop: usize,
        num_reps: u32,
        rep_duration: Option<TimeMs>,
    ) -> CockpitResult<()> {
        let name = executor.name().to_string();
        let run = self.bus.execute_and_wait_for(
            EXPERIMENT_EXECUTION,
            executor.execute_table(self.table, start, stop, num_reps, rep_duration),
        );
        let result = match self.settings.executor_timeout {
            Some(timeout) => tokio::time::timeout(timeout, run).await.map_err(|_| {
                CockpitError::ExecutorTimeout {
                    executor: name.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
            })?,
            None => run.await,
        };
        let ((), released) = result.on_device(&name)?;
        if matches!(released, Released::Aborted) {
            warn!(executor = %name, "stopped waiting for executor after abort");
        }
        Ok(())
    }

    async fn fallback(&self, index: usize, action: &Action) -> CockpitResult<()> {
        match (&action.handler, &action.param) {
            (HandlerRef::Camera(camera), ActionParam::Digital(high))
                if camera.supports_soft_trigger() =>
            {
                if *high {
                    debug!(camera = %camera.name(), "soft trigger");
                    camera.soft_trigger().await.on_device(camera.name())?;
                }
                Ok(())
            }
            (HandlerRef::Positioner(stage), ActionParam::Position(position)) => {
                debug!(stage = %stage.name(), position, "direct move");
                stage.move_absolute(*position).await.on_device(stage.name())
            }
            (handler, _) => Err(CockpitError::UnrunnableAction {
                index,
                handler: handler.name().to_string(),
            }),
        }
    }
}
