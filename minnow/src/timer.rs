//! One-shot software timers owned by actors.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
struct TimerEntry {
    owner: String,
    deadline: Instant,
}

/// All armed timers of a node, at most one per actor.
#[derive(Debug, Default)]
pub struct Timers {
    entries: Vec<TimerEntry>,
}

impl Timers {
    /// No timers armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer of `owner` to expire `delay` after `now`.
    ///
    /// A deadline past the clock's range never expires, so the timer is
    /// disarmed instead.
    pub fn arm(&mut self, owner: &str, now: Instant, delay: Duration) {
        let Some(deadline) = now.checked_add(delay) else {
            tracing::warn!(actor = %owner, ?delay, "timer delay out of range");
            self.cancel(owner);
            return;
        };
        match self.entries.iter_mut().find(|e| e.owner == owner) {
            Some(entry) => entry.deadline = deadline,
            None => self.entries.push(TimerEntry {
                owner: owner.to_string(),
                deadline,
            }),
        }
        tracing::trace!(actor = %owner, ?delay, "timer armed");
    }

    /// Disarm the timer of `owner`.
    pub fn cancel(&mut self, owner: &str) {
        self.entries.retain(|e| e.owner != owner);
    }

    /// Whether `owner` has a timer, expired or not.
    pub fn is_armed(&self, owner: &str) -> bool {
        self.entries.iter().any(|e| e.owner == owner)
    }

    /// Consume the timer of `owner` if it expired at `now`.
    pub fn take_expired(&mut self, owner: &str, now: Instant) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.owner == owner && e.deadline <= now));
        self.entries.len() != before
    }

    /// Earliest deadline among armed timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timer is armed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every timer.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
