//! Executor handler for boards with digital and analogue output lines.
//!
//! One handler type drives both controller families. The [`Encoding`] picked
//! at construction decides how a compiled table slice is turned into an
//! [`ExecutorProgram`]; everything else (line bookkeeping, compilation,
//! completion handshake, hardware abort) is shared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cockpit_core::events::{executor_done, EXPERIMENT_EXECUTION, UPDATE_STATUS_LIGHT, USER_ABORT};
use cockpit_core::{
    ActionTable, CockpitError, CockpitResult, DeviceHandler, DeviceKind, EventBus, EventPayload,
    Executor, HandlerRef, PositionLimits, Released, TimeMs,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::analog_line::{AnalogLineHandler, AnalogOutput, IndexedPositions, MovementTime};
use crate::backend::{ExecutorBackend, ExecutorProgram, ProgramBody};
use crate::compile::{compile_states, LineMap};
use crate::encoding::{actions_from_states, Encoding, TickEncoder};

/// Mid-scale level the legacy board parks its analogue lines at.
pub const LEGACY_ANALOG_MIDPOINT: f64 = 32768.0;

const TRIGGER_PULSE: Duration = Duration::from_millis(10);

/// Digital words are 32 bits wide.
pub const MAX_DIGITAL_LINES: u32 = u32::BITS;

fn default_dlines() -> u32 {
    16
}

fn default_alines() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitalAnalogConfig {
    pub name: String,
    #[serde(default = "default_dlines")]
    pub dlines: u32,
    #[serde(default = "default_alines")]
    pub alines: usize,
    #[serde(default)]
    pub encoding: Encoding,
}

impl DigitalAnalogConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dlines: default_dlines(),
            alines: default_alines(),
            encoding: Encoding::default(),
        }
    }

    pub fn validate(&self) -> CockpitResult<()> {
        if self.dlines > MAX_DIGITAL_LINES {
            return Err(CockpitError::Configuration(format!(
                "{} declares {} digital lines, at most {MAX_DIGITAL_LINES} are supported",
                self.name, self.dlines
            )));
        }
        Ok(())
    }
}

fn default_gain() -> f64 {
    1.0
}

/// An analogue client wired to one of the executor's lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogLineConfig {
    pub name: String,
    pub line: usize,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_gain")]
    pub gain: f64,
    /// Fixed motion time; absent means instant.
    #[serde(default)]
    pub movement_time: Option<TimeMs>,
    #[serde(default)]
    pub positions: IndexedPositions,
    pub limits: (f64, f64),
}

/// A bare digital line exposed as a handler, for devices that delegate
/// their triggers to it.
#[derive(Debug)]
pub struct TriggerLine {
    name: String,
    line: u32,
}

impl TriggerLine {
    pub fn line(&self) -> u32 {
        self.line
    }
}

#[async_trait]
impl DeviceHandler for TriggerLine {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Generic
    }

    fn is_eligible_for_experiments(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct LegacyState {
    /// Level each analogue line held when the profile was loaded.
    baseline: Vec<f64>,
}

pub struct DigitalAnalogExecutor {
    name: String,
    dlines: u32,
    alines: usize,
    encoding: Encoding,
    backend: Arc<dyn ExecutorBackend>,
    bus: Arc<EventBus>,
    lines: RwLock<LineMap>,
    /// Analogue levels as last written; the legacy board cannot read them back.
    analog_cache: Mutex<Vec<f64>>,
    legacy: Mutex<LegacyState>,
    last_program: Mutex<Option<ExecutorProgram>>,
    aborted: AtomicBool,
    weak_self: Weak<DigitalAnalogExecutor>,
}

impl DigitalAnalogExecutor {
    /// Build the handler and subscribe it to user aborts.
    pub fn new(
        config: DigitalAnalogConfig,
        backend: Arc<dyn ExecutorBackend>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let executor = Arc::new_cyclic(|weak_self| Self {
            analog_cache: Mutex::new(vec![0.0; config.alines]),
            legacy: Mutex::new(LegacyState {
                baseline: vec![0.0; config.alines],
            }),
            name: config.name,
            dlines: config.dlines,
            alines: config.alines,
            encoding: config.encoding,
            backend,
            bus: Arc::clone(&bus),
            lines: RwLock::new(LineMap::default()),
            last_program: Mutex::new(None),
            aborted: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        let weak = Arc::downgrade(&executor);
        bus.subscribe(USER_ABORT, move |_| {
            if let Some(executor) = weak.upgrade() {
                executor.on_user_abort();
            }
        });
        executor
    }

    fn on_user_abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = Arc::clone(&self.backend);
                let name = self.name.clone();
                handle.spawn(async move {
                    if let Err(e) = backend.abort().await {
                        warn!(executor = %name, error = %e, "hardware abort failed");
                    }
                });
            }
            Err(_) => warn!(executor = %self.name, "no runtime to send hardware abort"),
        }
        self.bus.publish(&executor_done(&self.name), EventPayload::None);
    }

    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    fn check_digital_line(&self, line: u32) -> CockpitResult<()> {
        if line >= self.dlines.min(MAX_DIGITAL_LINES) {
            return Err(CockpitError::Configuration(format!(
                "{} has {} digital lines, line {line} requested",
                self.name,
                self.dlines.min(MAX_DIGITAL_LINES)
            )));
        }
        Ok(())
    }

    fn check_analog_line(&self, line: usize) -> CockpitResult<()> {
        if line >= self.alines {
            return Err(CockpitError::Configuration(format!(
                "{} has {} analogue lines, line {line} requested",
                self.name, self.alines
            )));
        }
        Ok(())
    }

    /// Wire a client (camera, light, ...) to a digital line. Toggles for the
    /// client in a table drive that line.
    pub fn register_digital(&self, client: &str, line: u32) -> CockpitResult<()> {
        self.check_digital_line(line)?;
        let mut lines = self.lines.write();
        if let Some((other, _)) = lines
            .digital
            .iter()
            .find(|(name, &l)| l == line && name.as_str() != client)
        {
            return Err(CockpitError::Configuration(format!(
                "{} line {line} already drives '{other}'",
                self.name
            )));
        }
        lines.digital.insert(client.to_string(), line);
        debug!(executor = %self.name, client, line, "registered digital client");
        Ok(())
    }

    /// Expose a digital line as its own handler.
    pub fn register_trigger_line(&self, name: &str, line: u32) -> CockpitResult<HandlerRef> {
        self.register_digital(name, line)?;
        let handler: Arc<dyn DeviceHandler> = Arc::new(TriggerLine {
            name: name.to_string(),
            line,
        });
        Ok(HandlerRef::Generic(handler))
    }

    pub fn register_analog(
        &self,
        config: &AnalogLineConfig,
    ) -> CockpitResult<Arc<AnalogLineHandler>> {
        self.check_analog_line(config.line)?;
        if config.gain == 0.0 {
            return Err(CockpitError::Configuration(format!(
                "analogue line '{}' has zero gain",
                config.name
            )));
        }
        let mut lines = self.lines.write();
        if lines.analog.values().any(|h| h.line() == config.line) {
            return Err(CockpitError::Configuration(format!(
                "{} analogue line {} is already in use",
                self.name, config.line
            )));
        }
        let movement = config
            .movement_time
            .map_or(MovementTime::Instant, MovementTime::Fixed);
        let source: Weak<dyn AnalogOutput> = self.weak_self.clone();
        let handler = Arc::new(AnalogLineHandler::new(
            config.name.clone(),
            config.line,
            config.offset,
            config.gain,
            movement,
            config.positions.clone(),
            PositionLimits::new(config.limits.0, config.limits.1)?,
            source,
        ));
        lines
            .analog
            .insert(config.name.clone(), Arc::clone(&handler));
        Ok(handler)
    }

    pub fn analog_lines(&self) -> Vec<Arc<AnalogLineHandler>> {
        self.lines.read().analog.values().cloned().collect()
    }

    /// The most recent program handed to the backend.
    pub fn last_program(&self) -> Option<ExecutorProgram> {
        self.last_program.lock().clone()
    }

    pub async fn set_digital(&self, line: u32, high: bool) -> Result<()> {
        self.check_digital_line(line)?;
        let current = self.backend.read_digital().await?;
        let bit = 1u32
            .checked_shl(line)
            .ok_or_else(|| anyhow!("{}: no digital line {line}", self.name))?;
        let state = if high { current | bit } else { current & !bit };
        self.backend.write_digital(state).await
    }

    /// Pulse a client's line from software.
    pub async fn trigger_now(&self, client: &str) -> Result<()> {
        let line = self
            .lines
            .read()
            .digital
            .get(client)
            .copied()
            .ok_or_else(|| anyhow!("'{client}' is not wired to {}", self.name))?;
        self.set_digital(line, true).await?;
        tokio::time::sleep(TRIGGER_PULSE).await;
        self.set_digital(line, false).await
    }

    async fn current_analog(&self) -> Result<Vec<f64>> {
        match self.encoding {
            Encoding::LegacyTicks { .. } => Ok(self.analog_cache.lock().clone()),
            Encoding::Absolute => {
                let mut levels = Vec::with_capacity(self.alines);
                for line in 0..self.alines {
                    levels.push(self.backend.read_analog(line).await?);
                }
                Ok(levels)
            }
        }
    }

    async fn encode(
        &self,
        states: Vec<crate::backend::StateAction>,
        pre_run_digital: u32,
        num_reps: u32,
        rep_duration: Option<TimeMs>,
    ) -> Result<ExecutorProgram> {
        // Both encodings run relative to the slice start and hold the last
        // state until the repeat duration.
        let states = actions_from_states(&states, rep_duration);
        let body = match &self.encoding {
            Encoding::Absolute => ProgramBody::States(states),
            Encoding::LegacyTicks { ticks_per_ms } => {
                let (moved, baseline) = {
                    let mut legacy = self.legacy.lock();
                    let moved = TickEncoder::lower_baseline(&states, &mut legacy.baseline);
                    (moved, legacy.baseline.clone())
                };
                for (line, level) in moved {
                    debug!(executor = %self.name, line, level, "lowering analogue baseline");
                    self.write_analog(line, level).await?;
                }
                let profile =
                    TickEncoder::new(*ticks_per_ms).encode(&states, &baseline, pre_run_digital)?;
                ProgramBody::Profile(profile)
            }
        };
        Ok(ExecutorProgram {
            body,
            num_reps,
            rep_duration,
        })
    }
}

#[async_trait]
impl AnalogOutput for DigitalAnalogExecutor {
    async fn set_analog_line(&self, line: usize, level: f64) -> Result<()> {
        self.write_analog(line, level).await
    }

    async fn get_analog_line(&self, line: usize) -> Result<f64> {
        self.read_analog(line).await
    }
}

#[async_trait]
impl DeviceHandler for DigitalAnalogExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Executor
    }

    async fn prepare_for_experiment(&self) -> Result<()> {
        for line in self.analog_lines() {
            line.save_position().await?;
        }
        if matches!(self.encoding, Encoding::LegacyTicks { .. }) {
            let levels = self.analog_cache.lock().clone();
            self.legacy.lock().baseline = levels;
        }
        Ok(())
    }

    async fn cleanup_after_experiment(&self) -> Result<()> {
        for line in self.analog_lines() {
            line.restore_position().await?;
        }
        Ok(())
    }

    async fn finalize_initialization(&self) -> Result<()> {
        if matches!(self.encoding, Encoding::LegacyTicks { .. }) {
            for line in 0..self.alines {
                self.write_analog(line, LEGACY_ANALOG_MIDPOINT).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for DigitalAnalogExecutor {
    fn num_runnable_lines(&self, table: &ActionTable, from: usize) -> usize {
        let lines = self.lines.read();
        (from..table.len())
            .map_while(|index| table.get(index))
            .take_while(|action| {
                let name = action.handler.name();
                name == self.name || lines.handles(name)
            })
            .count()
    }

    #[instrument(skip(self, table), fields(executor = %self.name), err)]
    async fn execute_table(
        &self,
        table: &ActionTable,
        start: usize,
        stop: usize,
        num_reps: u32,
        rep_duration: Option<TimeMs>,
    ) -> Result<()> {
        self.aborted.store(false, Ordering::SeqCst);
        let digital = self.backend.read_digital().await?;
        let analog = self.current_analog().await?;
        let lines = self.lines.read().clone();
        let states = compile_states(table, start, stop, &lines, self.dlines, digital, analog)?;
        if states.is_empty() {
            debug!("nothing to run");
            self.bus.publish(EXPERIMENT_EXECUTION, EventPayload::None);
            return Ok(());
        }

        self.bus.publish(
            UPDATE_STATUS_LIGHT,
            EventPayload::Status {
                light: "device waiting".to_string(),
                text: format!("Waiting for\n{} to finish", self.name),
            },
        );

        let final_levels = states.last().map(|s| s.analog.clone());
        let program = self.encode(states, digital, num_reps, rep_duration).await?;
        *self.last_program.lock() = Some(program.clone());

        let done_event = executor_done(&self.name);
        let bus = Arc::clone(&self.bus);
        let hook_event = done_event.clone();
        let hook = Box::new(move || bus.publish(&hook_event, EventPayload::None));
        info!(num_reps, "running table slice");
        let ((), released) = self
            .bus
            .execute_and_wait_for(&done_event, self.backend.run(program, hook))
            .await?;

        if matches!(released, Released::Aborted) || self.aborted.load(Ordering::SeqCst) {
            warn!("table slice aborted");
        } else if let Some(levels) = final_levels {
            *self.analog_cache.lock() = levels;
        }
        self.bus.publish(EXPERIMENT_EXECUTION, EventPayload::None);
        Ok(())
    }

    async fn read_digital(&self) -> Result<u32> {
        self.backend.read_digital().await
    }

    async fn write_digital(&self, state: u32) -> Result<()> {
        self.backend.write_digital(state).await
    }

    async fn read_analog(&self, line: usize) -> Result<f64> {
        self.check_analog_line(line)?;
        match self.encoding {
            Encoding::LegacyTicks { .. } => self
                .analog_cache
                .lock()
                .get(line)
                .copied()
                .ok_or_else(|| anyhow!("no analogue line {line}")),
            Encoding::Absolute => self.backend.read_analog(line).await,
        }
    }

    async fn write_analog(&self, line: usize, level: f64) -> Result<()> {
        self.check_analog_line(line)?;
        self.backend.write_analog(line, level).await?;
        if let Some(slot) = self.analog_cache.lock().get_mut(line) {
            *slot = level;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DigitalAnalogExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalAnalogExecutor")
            .field("name", &self.name)
            .field("dlines", &self.dlines)
            .field("alines", &self.alines)
            .field("encoding", &self.encoding)
            .finish()
    }
}
