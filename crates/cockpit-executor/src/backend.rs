//! The seam between an executor handler and the controller it drives.
//!
//! An [`ExecutorBackend`] is the remote board (DSP, FPGA, ...) as seen from
//! the handler. The handler compiles and encodes table slices into an
//! [`ExecutorProgram`]; the backend only loads and runs it.

use anyhow::Result;
use async_trait::async_trait;
use cockpit_core::TimeMs;

use crate::encoding::TickProfile;

/// Combined output state at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct StateAction {
    pub time: TimeMs,
    /// Bit per digital line.
    pub digital: u32,
    /// Native level per analogue line.
    pub analog: Vec<f64>,
}

/// Encoded program body, one variant per controller family.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramBody {
    /// Absolute states at times relative to the start of the slice.
    States(Vec<StateAction>),
    /// Legacy clock-tick profile with analogue offsets.
    Profile(TickProfile),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorProgram {
    pub body: ProgramBody,
    pub num_reps: u32,
    pub rep_duration: Option<TimeMs>,
}

/// Called by the backend once every repeat of a program has finished.
pub type CompletionHook = Box<dyn FnOnce() + Send + 'static>;

#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    async fn read_digital(&self) -> Result<u32>;

    async fn write_digital(&self, state: u32) -> Result<()>;

    async fn read_analog(&self, line: usize) -> Result<f64>;

    async fn write_analog(&self, line: usize, level: f64) -> Result<()>;

    /// Load and start `program`. May return before it finishes; `done` must be
    /// called exactly once when it has, unless the run is aborted.
    async fn run(&self, program: ExecutorProgram, done: CompletionHook) -> Result<()>;

    /// Hardware stop.
    async fn abort(&self) -> Result<()>;
}
