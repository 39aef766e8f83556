//! Simulated executor board.
//!
//! Plays loaded programs back line by line and forwards every digital edge to
//! the devices wired to that line, so cameras produce frames and lights count
//! pulses exactly when the table says they should. In Instant mode a program
//! plays out before `run` returns; in Realistic mode it plays on a spawned
//! task against the wall clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{bail, Result};
use async_trait::async_trait;
use cockpit_core::TimeMs;
use cockpit_executor::{CompletionHook, ExecutorBackend, ExecutorProgram, ProgramBody, TickProfile};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::common::{ErrorConfig, MockMode, TimingConfig};

/// A device wired to a digital output line.
pub trait TriggerListener: Send + Sync {
    fn on_edge(&self, high: bool);
}

/// One output update during playback.
#[derive(Debug, Clone, PartialEq)]
struct Step {
    at: TimeMs,
    digital: u32,
    analog: Vec<(usize, f64)>,
}

pub struct MockExecutorBackend {
    name: String,
    mode: MockMode,
    errors: ErrorConfig,
    timing: TimingConfig,
    digital: Mutex<u32>,
    analog: Mutex<Vec<f64>>,
    listeners: RwLock<HashMap<u32, Vec<Arc<dyn TriggerListener>>>>,
    programs: Mutex<Vec<ExecutorProgram>>,
    aborted: AtomicBool,
    aborts: AtomicU64,
    weak_self: Weak<Self>,
}

impl MockExecutorBackend {
    pub fn new(name: impl Into<String>, alines: usize, mode: MockMode) -> Arc<Self> {
        Self::with_errors(name, alines, mode, ErrorConfig::none())
    }

    pub fn with_errors(
        name: impl Into<String>,
        alines: usize,
        mode: MockMode,
        errors: ErrorConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            name: name.into(),
            mode,
            errors,
            timing: TimingConfig::executor(),
            digital: Mutex::new(0),
            analog: Mutex::new(vec![0.0; alines]),
            listeners: RwLock::new(HashMap::new()),
            programs: Mutex::new(Vec::new()),
            aborted: AtomicBool::new(false),
            aborts: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    /// Wire `listener` to digital `line`.
    pub fn attach(&self, line: u32, listener: Arc<dyn TriggerListener>) {
        self.listeners.write().entry(line).or_default().push(listener);
    }

    /// Every program loaded so far, oldest first.
    pub fn programs(&self) -> Vec<ExecutorProgram> {
        self.programs.lock().clone()
    }

    pub fn digital_state(&self) -> u32 {
        *self.digital.lock()
    }

    pub fn analog_state(&self) -> Vec<f64> {
        self.analog.lock().clone()
    }

    pub fn abort_count(&self) -> u64 {
        self.aborts.load(Ordering::SeqCst)
    }

    fn steps(&self, body: &ProgramBody) -> Vec<Step> {
        match body {
            ProgramBody::States(states) => states
                .iter()
                .map(|s| Step {
                    at: s.time,
                    digital: s.digital,
                    analog: s.analog.iter().copied().enumerate().collect(),
                })
                .collect(),
            ProgramBody::Profile(profile) => profile_steps(profile, &self.analog_state()),
        }
    }

    fn apply(&self, step: &Step) {
        let previous = std::mem::replace(&mut *self.digital.lock(), step.digital);
        {
            let mut analog = self.analog.lock();
            for &(line, level) in &step.analog {
                if let Some(slot) = analog.get_mut(line) {
                    *slot = level;
                }
            }
        }
        let changed = previous ^ step.digital;
        if changed == 0 {
            return;
        }
        let edges: Vec<(Arc<dyn TriggerListener>, bool)> = {
            let listeners = self.listeners.read();
            (0..32u32)
                .filter(|bit| changed & (1 << bit) != 0)
                .flat_map(|bit| {
                    let high = step.digital & (1 << bit) != 0;
                    listeners
                        .get(&bit)
                        .into_iter()
                        .flatten()
                        .map(move |l| (Arc::clone(l), high))
                })
                .collect()
        };
        for (listener, high) in edges {
            listener.on_edge(high);
        }
    }

    async fn play(&self, program: ExecutorProgram, done: CompletionHook) {
        let steps = self.steps(&program.body);
        for rep in 0..program.num_reps {
            let rep_start = Instant::now();
            for step in &steps {
                if self.mode.is_realistic() {
                    tokio::time::sleep_until(rep_start + step.at.as_duration()).await;
                }
                if self.aborted.load(Ordering::SeqCst) {
                    warn!(executor = %self.name, rep, "playback aborted");
                    return;
                }
                self.apply(step);
            }
            if let (true, Some(duration)) = (self.mode.is_realistic(), program.rep_duration) {
                tokio::time::sleep_until(rep_start + duration.as_duration()).await;
            }
        }
        debug!(executor = %self.name, reps = program.num_reps, "playback complete");
        done();
    }
}

/// Expand a tick profile into playback steps; analogue offsets are taken
/// relative to the levels held when the profile was loaded.
fn profile_steps(profile: &TickProfile, baseline: &[f64]) -> Vec<Step> {
    let tick_ps = (profile.description.clock_us * 1_000_000.0).round() as i64;
    let mut by_tick: BTreeMap<u32, (Option<u32>, Vec<(usize, f64)>)> = BTreeMap::new();
    for &(tick, word) in &profile.digitals {
        by_tick.entry(tick).or_default().0 = Some(word);
    }
    for (line, events) in profile.analogs.iter().enumerate() {
        let base = baseline.get(line).copied().unwrap_or(0.0);
        for &(tick, offset) in events {
            by_tick
                .entry(tick)
                .or_default()
                .1
                .push((line, base + f64::from(offset)));
        }
    }
    let mut word = profile.description.init_dio;
    by_tick
        .into_iter()
        .map(|(tick, (digital, analog))| {
            word = digital.unwrap_or(word);
            Step {
                at: TimeMs::from_ps(i64::from(tick) * tick_ps),
                digital: word,
                analog,
            }
        })
        .collect()
}

#[async_trait]
impl ExecutorBackend for MockExecutorBackend {
    async fn read_digital(&self) -> Result<u32> {
        self.errors.check_operation(&self.name, "read")?;
        Ok(self.digital_state())
    }

    async fn write_digital(&self, state: u32) -> Result<()> {
        self.errors.check_operation(&self.name, "write")?;
        self.timing.communicate(self.mode).await;
        self.apply(&Step {
            at: TimeMs::ZERO,
            digital: state,
            analog: Vec::new(),
        });
        Ok(())
    }

    async fn read_analog(&self, line: usize) -> Result<f64> {
        self.errors.check_operation(&self.name, "read")?;
        match self.analog.lock().get(line) {
            Some(level) => Ok(*level),
            None => bail!("{}: no analogue line {line}", self.name),
        }
    }

    async fn write_analog(&self, line: usize, level: f64) -> Result<()> {
        self.errors.check_operation(&self.name, "write")?;
        self.timing.communicate(self.mode).await;
        match self.analog.lock().get_mut(line) {
            Some(slot) => {
                *slot = level;
                Ok(())
            }
            None => bail!("{}: no analogue line {line}", self.name),
        }
    }

    async fn run(&self, program: ExecutorProgram, done: CompletionHook) -> Result<()> {
        self.errors.check_operation(&self.name, "run")?;
        self.aborted.store(false, Ordering::SeqCst);
        self.programs.lock().push(program.clone());
        info!(executor = %self.name, reps = program.num_reps, "program loaded");
        match self.mode {
            MockMode::Instant => self.play(program, done).await,
            MockMode::Realistic => {
                let Some(this) = self.weak_self.upgrade() else {
                    bail!("{}: backend dropped", self.name);
                };
                tokio::spawn(async move { this.play(program, done).await });
            }
        }
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.aborted.store(true, Ordering::SeqCst);
        self.aborts.fetch_add(1, Ordering::SeqCst);
        info!(executor = %self.name, "hardware abort");
        Ok(())
    }
}

impl std::fmt::Debug for MockExecutorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockExecutorBackend")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("digital", &self.digital_state())
            .finish()
    }
}
