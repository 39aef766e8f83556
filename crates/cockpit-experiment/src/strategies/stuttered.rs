use cockpit_core::{ActionTable, CockpitError, CockpitResult, TimeMs};
use serde::{Deserialize, Serialize};

use super::{ActionGenerator, GenerationContext, RepBlock, ZStack};

/// Repetitions taken at one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRate {
    /// Time from the start of one stack to the start of the next.
    pub interval: TimeMs,
    pub num_reps: u32,
}

/// A Z stack whose sampling interval changes over the run, e.g. bursts of
/// fast volumes separated by slow ones.
///
/// The rates are cycled until the experiment's repetition count is reached.
#[derive(Debug, Clone)]
pub struct StutteredZStack {
    rates: Vec<SampleRate>,
}

impl StutteredZStack {
    pub fn new(rates: Vec<SampleRate>) -> CockpitResult<Self> {
        if rates.is_empty() {
            return Err(CockpitError::Configuration(
                "stuttered Z stack needs at least one sampling rate".into(),
            ));
        }
        if rates.iter().any(|r| r.num_reps == 0) {
            return Err(CockpitError::Configuration(
                "every sampling rate needs at least one repetition".into(),
            ));
        }
        Ok(Self { rates })
    }

    pub fn rates(&self) -> &[SampleRate] {
        &self.rates
    }
}

impl ActionGenerator for StutteredZStack {
    fn name(&self) -> &str {
        "stuttered z-stack"
    }

    fn metadata(&self) -> Option<String> {
        let rates: Vec<String> = self
            .rates
            .iter()
            .map(|r| format!("{}x{}", r.num_reps, r.interval))
            .collect();
        Some(format!("Sampling: {}", rates.join(", ")))
    }

    fn generate_actions(&self, ctx: &mut GenerationContext<'_>) -> CockpitResult<ActionTable> {
        ZStack.generate_actions(ctx)
    }

    fn rep_blocks(&self, num_reps: u32, _rep_duration: TimeMs) -> Vec<RepBlock> {
        let mut blocks = Vec::new();
        let mut remaining = num_reps;
        for rate in self.rates.iter().cycle() {
            if remaining == 0 {
                break;
            }
            let reps = rate.num_reps.min(remaining);
            blocks.push(RepBlock {
                num_reps: reps,
                rep_duration: rate.interval,
            });
            remaining -= reps;
        }
        blocks
    }
}
