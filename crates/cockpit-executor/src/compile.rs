//! Fold a table slice into output states.
//!
//! Every action in the slice either sets a bit for a digital client or a
//! level for an analogue client. Consecutive actions at the same time are
//! merged into one state. A repeated identical action is dropped; two
//! different actions for one handler at one time are an error.

use std::collections::HashMap;
use std::sync::Arc;

use cockpit_core::{ActionParam, ActionTable, CockpitError, CockpitResult, TimeMs};

use crate::analog_line::AnalogLineHandler;
use crate::backend::StateAction;

/// Who is wired to which line.
#[derive(Default, Clone)]
pub struct LineMap {
    pub digital: HashMap<String, u32>,
    pub analog: HashMap<String, Arc<AnalogLineHandler>>,
}

impl LineMap {
    pub fn handles(&self, name: &str) -> bool {
        self.digital.contains_key(name) || self.analog.contains_key(name)
    }
}

pub fn compile_states(
    table: &ActionTable,
    start: usize,
    stop: usize,
    lines: &LineMap,
    dlines: u32,
    mut digital: u32,
    mut analog: Vec<f64>,
) -> CockpitResult<Vec<StateAction>> {
    let mask = if dlines >= 32 { u32::MAX } else { (1u32 << dlines) - 1 };
    let mut states: Vec<StateAction> = Vec::with_capacity(stop.saturating_sub(start));
    let mut prev_time: Option<TimeMs> = None;
    let mut seen: Vec<(&str, &ActionParam)> = Vec::new();

    for index in start..stop {
        let Some(action) = table.get(index) else {
            continue;
        };
        let name = action.handler.name();

        if let Some(line) = lines.analog.get(name) {
            let position = match &action.param {
                ActionParam::Position(p) => *p,
                ActionParam::Indexed { index, wavelength } => {
                    line.indexed_position(*index, *wavelength)?
                }
                ActionParam::Digital(_) => {
                    return Err(CockpitError::Configuration(format!(
                        "digital action for analogue line '{name}' at index {index}"
                    )))
                }
            };
            if let Some(level) = analog.get_mut(line.line()) {
                *level = line.pos_to_native(position);
            }
        } else if let Some(&bit) = lines.digital.get(name) {
            let change = 1u32.checked_shl(bit).ok_or_else(|| {
                CockpitError::Configuration(format!(
                    "digital line {bit} of '{name}' does not fit a 32-bit word"
                ))
            })?;
            match action.param {
                ActionParam::Digital(true) => digital |= change,
                ActionParam::Digital(false) => digital = (digital & mask) & !change,
                _ => {
                    return Err(CockpitError::Configuration(format!(
                        "non-digital action for digital line '{name}' at index {index}"
                    )))
                }
            }
        }

        let state = StateAction {
            time: action.time,
            digital,
            analog: analog.clone(),
        };
        if prev_time == Some(action.time) {
            match seen.iter().find(|(h, _)| *h == name) {
                None => {
                    if let Some(last) = states.last_mut() {
                        *last = state;
                    }
                    seen.push((name, &action.param));
                }
                Some((_, param)) if **param == action.param => continue,
                Some(_) => {
                    return Err(CockpitError::ConflictingActions {
                        handler: name.to_string(),
                        time: action.time.to_string(),
                    })
                }
            }
        } else {
            states.push(state);
            seen.clear();
            seen.push((name, &action.param));
            prev_time = Some(action.time);
        }
    }
    Ok(states)
}
