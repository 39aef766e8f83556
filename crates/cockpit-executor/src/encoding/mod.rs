//! Translations of compiled states into controller programs.
//!
//! - [`absolute`]: states with times relative to the slice start
//! - [`ticks`]: legacy DSP profile quantised to a device clock

pub mod absolute;
pub mod ticks;

use serde::{Deserialize, Serialize};

pub use absolute::actions_from_states;
pub use ticks::{ProfileDescription, TickEncoder, TickProfile, DEFAULT_TICKS_PER_MS};

/// Which program format a controller understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Encoding {
    Absolute,
    LegacyTicks {
        #[serde(default = "default_ticks_per_ms")]
        ticks_per_ms: i64,
    },
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Absolute
    }
}

fn default_ticks_per_ms() -> i64 {
    DEFAULT_TICKS_PER_MS
}
