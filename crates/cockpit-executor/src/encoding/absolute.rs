use cockpit_core::TimeMs;

use crate::backend::StateAction;

/// Rebase states onto the first state's time.
///
/// With a repeat duration, the last state is held until the repeat duration
/// has elapsed by appending a copy of it at that time.
pub fn actions_from_states(
    states: &[StateAction],
    rep_duration: Option<TimeMs>,
) -> Vec<StateAction> {
    let Some(first) = states.first() else {
        return Vec::new();
    };
    let t0 = first.time;
    let mut actions: Vec<StateAction> = states
        .iter()
        .map(|s| StateAction {
            time: s.time - t0,
            ..s.clone()
        })
        .collect();

    if let Some(duration) = rep_duration {
        if let Some(last) = actions.last() {
            if last.time < duration {
                let hold = StateAction {
                    time: duration,
                    ..last.clone()
                };
                actions.push(hold);
            }
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(ms: i64, digital: u32) -> StateAction {
        StateAction {
            time: TimeMs::from_ms(ms),
            digital,
            analog: vec![0.0],
        }
    }

    #[test]
    fn rebases_on_first_state() {
        let out = actions_from_states(&[state(5, 1), state(7, 0)], None);
        assert_eq!(out[0].time, TimeMs::ZERO);
        assert_eq!(out[1].time, TimeMs::from_ms(2));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn holds_last_state_until_repeat_duration() {
        let out = actions_from_states(&[state(0, 1), state(4, 2)], Some(TimeMs::from_ms(10)));
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].time, TimeMs::from_ms(10));
        assert_eq!(out[2].digital, 2);

        let out = actions_from_states(&[state(0, 1), state(12, 2)], Some(TimeMs::from_ms(10)));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn empty_input() {
        assert!(actions_from_states(&[], Some(TimeMs::from_ms(1))).is_empty());
    }
}
