//! The schedule for one experiment repetition.
//!
//! An [`ActionTable`] is an ordered list of `(time, handler, parameter)`
//! triples. Tables are appended to while an experiment builds its schedule,
//! sorted, normalised so the first action is at t = 0, and then read by the
//! execution task.
//!
//! Slots can be nulled with [`ActionTable::remove`] and compacted later with
//! [`ActionTable::clear_bad_entries`], so indices stay valid while a caller
//! walks the table and deletes entries.
//!
//! The first/last action times are cached. Appends keep the cache current;
//! any other mutation marks it dirty and the next query rescans.

use std::fmt::Write as _;

use crate::handler::{ActionParam, HandlerRef};
use crate::time::TimeMs;

/// Width of a toggle pulse.
pub const TOGGLE_TIME: TimeMs = TimeMs::from_us(100);

/// One scheduled hardware action.
#[derive(Debug, Clone)]
pub struct Action {
    pub time: TimeMs,
    pub handler: HandlerRef,
    pub param: ActionParam,
}

#[derive(Debug, Clone, Default)]
pub struct ActionTable {
    slots: Vec<Option<Action>>,
    extrema: Option<(TimeMs, TimeMs)>,
    dirty: bool,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action and return its time.
    pub fn add_action(&mut self, time: TimeMs, handler: &HandlerRef, param: ActionParam) -> TimeMs {
        self.slots.push(Some(Action {
            time,
            handler: handler.clone(),
            param,
        }));
        if !self.dirty {
            self.extrema = Some(match self.extrema {
                None => (time, time),
                Some((first, last)) => (first.min(time), last.max(time)),
            });
        }
        time
    }

    /// Insert a high/low pulse for `handler` and return the time the pulse ends.
    ///
    /// Handlers with a [`ToggleRoute`](crate::handler::ToggleRoute) pulse their
    /// trigger line instead, for at least the route's pulse width.
    pub fn add_toggle(&mut self, time: TimeMs, handler: &HandlerRef) -> TimeMs {
        let (target, width) = match handler.toggle_route() {
            Some(route) => (route.target, route.pulse.max(TOGGLE_TIME)),
            None => (handler.clone(), TOGGLE_TIME),
        };
        self.add_action(time, &target, ActionParam::Digital(true));
        self.add_action(time + width, &target, ActionParam::Digital(false));
        time + width
    }

    /// Number of slots, including nulled ones.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Action> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Replace the slot at `index`. Passing `None` deletes the entry without
    /// shifting later indices.
    pub fn set(&mut self, index: usize, action: Option<Action>) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = action;
            self.dirty = true;
        }
    }

    pub fn remove(&mut self, index: usize) -> Option<Action> {
        let taken = self.slots.get_mut(index).and_then(Option::take);
        if taken.is_some() {
            self.dirty = true;
        }
        taken
    }

    /// Live actions in slot order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Action> {
        self.slots.iter().flatten()
    }

    /// Stable sort by time. Nulled slots move to the front.
    pub fn sort(&mut self) {
        self.slots.sort_by_key(|slot| slot.as_ref().map(|a| a.time));
    }

    /// Compact the table by dropping nulled slots.
    pub fn clear_bad_entries(&mut self) {
        self.slots.retain(Option::is_some);
        self.dirty = true;
    }

    /// Shift everything so the first action is at t = 0 if it was negative.
    /// The table must be sorted.
    pub fn enforce_positive_timepoints(&mut self) {
        let Some(first) = self.iter().next().map(|a| a.time) else {
            return;
        };
        let delta = -first;
        if delta.is_negative() {
            return;
        }
        for action in self.slots.iter_mut().flatten() {
            action.time += delta;
        }
        if let Some((first, last)) = self.extrema {
            self.extrema = Some((first + delta, last + delta));
        }
    }

    /// Delay every action at or after `mark` by `delta`.
    pub fn shift_actions_back(&mut self, mark: TimeMs, delta: TimeMs) {
        for action in self.slots.iter_mut().flatten() {
            if action.time >= mark {
                action.time += delta;
            }
        }
        self.dirty = true;
    }

    /// Time and parameter of the last action for `handler`. The table must be sorted.
    pub fn last_action_for(&self, handler: &HandlerRef) -> Option<(TimeMs, &ActionParam)> {
        self.iter()
            .rev()
            .find(|a| &a.handler == handler)
            .map(|a| (a.time, &a.param))
    }

    /// First and last action times, `None` for an empty table.
    ///
    /// With `use_cache` the cached values are returned unless a mutation has
    /// invalidated them.
    pub fn first_and_last_action_times(&self, use_cache: bool) -> Option<(TimeMs, TimeMs)> {
        if use_cache && !self.dirty {
            return self.extrema;
        }
        self.scan_extrema()
    }

    /// Rescan and store the extrema, clearing the dirty flag.
    pub fn refresh_extrema(&mut self) {
        self.extrema = self.scan_extrema();
        self.dirty = false;
    }

    fn scan_extrema(&self) -> Option<(TimeMs, TimeMs)> {
        self.iter().fold(None, |acc, a| match acc {
            None => Some((a.time, a.time)),
            Some((first, last)) => Some((first.min(a.time), last.max(a.time))),
        })
    }

    /// Length of the schedule from first to last action.
    pub fn duration(&self) -> TimeMs {
        self.first_and_last_action_times(true)
            .map(|(first, last)| last - first)
            .unwrap_or(TimeMs::ZERO)
    }

    /// Text listing of the table, optionally restricted to some handlers.
    pub fn pretty_string(&self, handlers: &[HandlerRef]) -> String {
        let mut out = String::new();
        for slot in &self.slots {
            match slot {
                None => out.push_str("<Deleted event>\n"),
                Some(action) => {
                    if handlers.is_empty() || handlers.contains(&action.handler) {
                        let _ = writeln!(
                            out,
                            "{:>12} {:>20} {:>20}",
                            action.time.to_string(),
                            action.handler.name(),
                            action.param.to_string()
                        );
                    }
                }
            }
        }
        out
    }
}

impl std::fmt::Display for ActionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.pretty_string(&[]))
    }
}
