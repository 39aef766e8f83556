//! Executor handlers for the cockpit experiment engine.
//!
//! A [`DigitalAnalogExecutor`] claims the table lines that target its own
//! digital and analogue clients, compiles them into output states and hands
//! an encoded [`ExecutorProgram`] to an [`ExecutorBackend`]. The scheduler
//! never sees the encoding.

pub mod analog_line;
pub mod backend;
pub mod compile;
pub mod delegate;
pub mod digital_analog;
pub mod encoding;

pub use analog_line::{AnalogLineHandler, AnalogOutput, IndexedPositions, MovementTime};
pub use backend::{CompletionHook, ExecutorBackend, ExecutorProgram, ProgramBody, StateAction};
pub use compile::{compile_states, LineMap};
pub use delegate::DelegatedTrigger;
pub use digital_analog::{
    AnalogLineConfig, DigitalAnalogConfig, DigitalAnalogExecutor, TriggerLine,
    LEGACY_ANALOG_MIDPOINT, MAX_DIGITAL_LINES,
};
pub use encoding::{Encoding, TickProfile};
