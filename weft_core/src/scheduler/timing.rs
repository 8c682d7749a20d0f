//! Action timing: debounce/throttle windows and the timer wheel.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::graph::ActionId;

/// Per-action timing options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    /// Defer execution by this window after every trigger; a new trigger
    /// restarts the window.
    pub debounce: Option<Duration>,

    /// Run at most once per window; triggers inside the window coalesce
    /// into one deferred run at its end.
    pub throttle: Option<Duration>,
}

impl Timing {
    /// Run on every trigger with no deferral.
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Debounce by `window`.
    pub fn debounce(window: Duration) -> Self {
        Self {
            debounce: Some(window),
            ..Self::default()
        }
    }

    /// Throttle to once per `window`.
    pub fn throttle(window: Duration) -> Self {
        Self {
            throttle: Some(window),
            ..Self::default()
        }
    }
}

/// Pending deadlines, ordered soonest-first. An action holds at most one
/// deadline at a time.
#[derive(Debug, Default)]
pub(crate) struct TimerWheel {
    deadlines: BTreeMap<Instant, Vec<ActionId>>,
}

impl TimerWheel {
    /// Schedule (or reschedule) `id` to fire at `at`.
    pub fn schedule(&mut self, id: ActionId, at: Instant) {
        self.cancel(id);
        self.deadlines.entry(at).or_default().push(id);
    }

    /// Drop any pending deadline for `id`.
    pub fn cancel(&mut self, id: ActionId) {
        for ids in self.deadlines.values_mut() {
            ids.retain(|other| *other != id);
        }
        self.deadlines.retain(|_, ids| !ids.is_empty());
    }

    /// True when `id` has a pending deadline.
    pub fn is_scheduled(&self, id: ActionId) -> bool {
        self.deadlines.values().any(|ids| ids.contains(&id))
    }

    /// The soonest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().copied()
    }

    /// Remove and return every action due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<ActionId> {
        let mut due = Vec::new();
        let later = self.deadlines.split_off(&(now + Duration::from_nanos(1)));
        for (_, ids) in std::mem::replace(&mut self.deadlines, later) {
            due.extend(ids);
        }
        due
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
