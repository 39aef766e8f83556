//! Shared state for running experiments.
//!
//! A [`RunContext`] is created once by the application and passed to every
//! experiment. It owns the device depot and the event bus, enforces that only
//! one experiment runs at a time, and remembers the last experiment and the
//! data files it produced.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::depot::DeviceDepot;
use crate::error::{CockpitError, CockpitResult};
use crate::events::EventBus;
use crate::time::TimeMs;

/// What the last experiment looked like, for introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRecord {
    pub kind: String,
    pub num_reps: u32,
    pub table_len: usize,
    pub table_duration: TimeMs,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct RunContext {
    depot: Arc<DeviceDepot>,
    bus: Arc<EventBus>,
    running: Arc<AtomicBool>,
    last_experiment: Mutex<Option<ExperimentRecord>>,
    generated_files: Mutex<Vec<PathBuf>>,
}

impl RunContext {
    pub fn new(depot: Arc<DeviceDepot>, bus: Arc<EventBus>) -> Self {
        Self {
            depot,
            bus,
            ..Default::default()
        }
    }

    pub fn depot(&self) -> &Arc<DeviceDepot> {
        &self.depot
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claim the single experiment slot. Released when the guard drops.
    pub fn begin_run(&self) -> CockpitResult<RunGuard> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CockpitError::Configuration(
                "an experiment is already running".to_string(),
            ));
        }
        Ok(RunGuard {
            running: Arc::clone(&self.running),
        })
    }

    pub fn record_experiment(&self, record: ExperimentRecord) {
        self.generated_files.lock().extend(record.files.iter().cloned());
        *self.last_experiment.lock() = Some(record);
    }

    pub fn last_experiment(&self) -> Option<ExperimentRecord> {
        self.last_experiment.lock().clone()
    }

    pub fn generated_files(&self) -> Vec<PathBuf> {
        self.generated_files.lock().clone()
    }
}

/// Marks an experiment as running for as long as it lives.
#[derive(Debug)]
pub struct RunGuard {
    running: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
