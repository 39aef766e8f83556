//! Error types for the experiment engine.
//!
//! `CockpitError` follows the engine's three failure classes:
//!
//! - **Configuration errors** (`Configuration`, `InexactTime`, `MissingHandler`,
//!   `LimitViolation`, `TitlesOverflow`) are raised while handlers are set up or
//!   while a table is built. Nothing has started moving yet, so they are fatal to
//!   the attempt without leaving hardware in a half-configured state.
//! - **Runtime hardware errors** (`Hardware`, `UnrunnableAction`,
//!   `ConflictingActions`, `ExecutorTimeout`) surface from the execution task and
//!   end the run. The engine never retries them.
//! - **User abort** is not an error. It is a cooperative flag, see
//!   [`crate::cancel::AbortToken`].
//!
//! Device trait methods return `anyhow::Result`; the engine converts those
//! failures into `Hardware` with the device name attached.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type CockpitResult<T> = std::result::Result<T, CockpitError>;

#[derive(Error, Debug)]
pub enum CockpitError {
    /// Semantic configuration problem (bad value, inconsistent settings).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A timing value that cannot be represented exactly.
    #[error("Inexact time value '{0}': schedule times must be exact to the picosecond")]
    InexactTime(String),

    #[error("Missing handler: {0}")]
    MissingHandler(String),

    #[error("Position {position} outside limits [{min}, {max}] for '{handler}'")]
    LimitViolation {
        handler: String,
        position: f64,
        min: f64,
        max: f64,
    },

    /// Header metadata needs more than the ten available title lines.
    #[error("Too many lines for the file header ({count} > 10); shorten the metadata:\n{lines}")]
    TitlesOverflow { count: usize, lines: String },

    /// No executor can run the line and software fallback does not apply.
    #[error("Found a line no executor could handle at index {index}: handler '{handler}'")]
    UnrunnableAction { index: usize, handler: String },

    /// Two actions for one handler at the same time with different parameters.
    #[error("Conflicting actions for '{handler}' at {time} ms")]
    ConflictingActions { handler: String, time: String },

    #[error("Executor '{executor}' did not signal completion within {timeout_ms} ms")]
    ExecutorTimeout { executor: String, timeout_ms: u64 },

    #[error("Hardware error on '{device}': {source}")]
    Hardware {
        device: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CockpitError {
    pub fn hardware(device: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Hardware {
            device: device.into(),
            source,
        }
    }

    /// Whether this error was raised before any hardware started running.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::InexactTime(_)
                | Self::MissingHandler(_)
                | Self::LimitViolation { .. }
                | Self::TitlesOverflow { .. }
        )
    }
}

/// Attach a device name to a failing hardware call.
pub trait HardwareContext<T> {
    fn on_device(self, device: &str) -> CockpitResult<T>;
}

impl<T> HardwareContext<T> for anyhow::Result<T> {
    fn on_device(self, device: &str) -> CockpitResult<T> {
        self.map_err(|e| CockpitError::hardware(device, e))
    }
}
