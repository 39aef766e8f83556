//! Legacy DSP profile encoding.
//!
//! The DSP runs a profile made of
//!
//! - a list of `(tick, digital word)` events, at most one per tick
//! - per analogue line, a list of `(tick, offset)` events recorded only when
//!   the level changes, where offsets are unsigned and relative to the level
//!   the line held when the profile was loaded
//! - a description block with the event counts
//!
//! The firmware drops analogue events at or after the last digital event and
//! misbehaves with a single event, so the encoder appends a no-op digital
//! event one tick after the last one in both cases.

use cockpit_core::{CockpitError, CockpitResult};
use serde::{Deserialize, Serialize};

use crate::backend::StateAction;

/// DSP clock ticks per millisecond.
pub const DEFAULT_TICKS_PER_MS: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDescription {
    /// Last tick used by any event.
    pub count: u32,
    /// Tick length in microseconds.
    pub clock_us: f64,
    /// Digital word before the profile starts.
    pub init_dio: u32,
    pub n_digital: usize,
    pub n_analog: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickProfile {
    pub description: ProfileDescription,
    pub digitals: Vec<(u32, u32)>,
    pub analogs: Vec<Vec<(u32, u32)>>,
}

#[derive(Debug, Clone, Copy)]
pub struct TickEncoder {
    ticks_per_ms: i64,
}

impl TickEncoder {
    pub fn new(ticks_per_ms: i64) -> Self {
        Self {
            ticks_per_ms: ticks_per_ms.max(1),
        }
    }

    /// Lower each baseline level to the lowest level the states reach so
    /// every offset is non-negative. Returns the `(line, level)` pairs that
    /// must be written to the hardware before the profile is loaded.
    pub fn lower_baseline(states: &[StateAction], baseline: &mut [f64]) -> Vec<(usize, f64)> {
        let mut moved = Vec::new();
        for (line, base) in baseline.iter_mut().enumerate() {
            let lowest = states
                .iter()
                .filter_map(|s| s.analog.get(line).copied())
                .fold(f64::INFINITY, f64::min);
            if lowest < *base {
                *base = lowest;
                moved.push((line, lowest));
            }
        }
        moved
    }

    pub fn encode(
        &self,
        states: &[StateAction],
        baseline: &[f64],
        init_dio: u32,
    ) -> CockpitResult<TickProfile> {
        if states.is_empty() {
            return Err(CockpitError::Configuration(
                "cannot encode an empty profile".to_string(),
            ));
        }
        let mut digitals: Vec<(u32, u32)> = Vec::new();
        let mut analogs: Vec<Vec<(u32, u32)>> = vec![Vec::new(); baseline.len()];
        let mut last_analog_tick: Option<u32> = None;

        for state in states {
            let raw = state.time.to_ticks(self.ticks_per_ms);
            let ticks = u32::try_from(raw).map_err(|_| {
                CockpitError::Configuration(format!(
                    "time {} ms does not fit the DSP clock",
                    state.time
                ))
            })?;

            match digitals.last_mut() {
                Some(last) if last.0 == ticks => last.1 = state.digital,
                _ => digitals.push((ticks, state.digital)),
            }

            for (line, events) in analogs.iter_mut().enumerate() {
                let level = state.analog.get(line).copied().unwrap_or(baseline[line]);
                let offset = (level - baseline[line]).max(0.0) as u32;
                if events.last().map_or(true, |&(_, prev)| prev != offset) {
                    events.push((ticks, offset));
                    last_analog_tick = Some(ticks);
                }
            }
        }

        if let Some(&(tick, word)) = digitals.last() {
            let analog_last = last_analog_tick.is_some_and(|ta| ta >= tick);
            if digitals.len() == 1 || analog_last {
                digitals.push((tick + 1, word));
            }
        }

        let count = digitals
            .iter()
            .map(|&(t, _)| t)
            .chain(analogs.iter().flatten().map(|&(t, _)| t))
            .max()
            .unwrap_or(0);

        Ok(TickProfile {
            description: ProfileDescription {
                count,
                clock_us: 1000.0 / self.ticks_per_ms as f64,
                init_dio,
                n_digital: digitals.len(),
                n_analog: analogs.iter().map(Vec::len).collect(),
            },
            digitals,
            analogs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cockpit_core::TimeMs;

    fn state(time: &str, digital: u32, analog: &[f64]) -> StateAction {
        StateAction {
            time: TimeMs::parse(time).unwrap(),
            digital,
            analog: analog.to_vec(),
        }
    }

    #[test]
    fn digital_events_are_quantised_and_deduplicated() {
        let encoder = TickEncoder::new(10);
        let states = [
            state("0", 1, &[0.0]),
            state("0.04", 3, &[0.0]),
            state("1.0", 0, &[0.0]),
        ];
        let profile = encoder.encode(&states, &[0.0], 0).unwrap();
        assert_eq!(profile.digitals, vec![(0, 3), (10, 0)]);
        assert_eq!(profile.analogs, vec![vec![(0, 0)]]);
        assert_eq!(profile.description.count, 10);
        assert_eq!(profile.description.clock_us, 100.0);
        assert_eq!(profile.description.n_analog, vec![1]);
    }

    #[test]
    fn single_event_gets_a_trailing_digital() {
        let encoder = TickEncoder::new(10);
        let profile = encoder.encode(&[state("2", 4, &[])], &[], 0).unwrap();
        assert_eq!(profile.digitals, vec![(20, 4), (21, 4)]);
        assert_eq!(profile.description.n_digital, 2);
    }

    #[test]
    fn last_event_must_be_digital() {
        let encoder = TickEncoder::new(10);
        let states = [
            state("0", 1, &[100.0]),
            state("1", 0, &[100.0]),
            state("1", 0, &[150.0]),
        ];
        let profile = encoder.encode(&states, &[100.0], 0).unwrap();
        assert_eq!(profile.analogs[0], vec![(0, 0), (10, 50)]);
        assert_eq!(profile.digitals.last(), Some(&(11, 0)));
    }

    #[test]
    fn baseline_drops_to_lowest_level() {
        let states = [state("0", 0, &[40.0, 90.0]), state("1", 0, &[20.0, 95.0])];
        let mut baseline = vec![30.0, 50.0];
        let moved = TickEncoder::lower_baseline(&states, &mut baseline);
        assert_eq!(moved, vec![(0, 20.0)]);
        assert_eq!(baseline, vec![20.0, 50.0]);

        let profile = TickEncoder::new(10).encode(&states, &baseline, 0).unwrap();
        assert_eq!(profile.analogs[0], vec![(0, 20), (10, 0)]);
        assert_eq!(profile.analogs[1], vec![(0, 40), (10, 45)]);
    }

    #[test]
    fn empty_profile_is_rejected() {
        assert!(TickEncoder::new(10).encode(&[], &[], 0).is_err());
    }
}
