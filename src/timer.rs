//! One-shot phase timers owned by a connection.

use std::time::Duration;

use crate::net::{EventBase, TimerKey};

/// A one-shot countdown registered with an [`EventBase`].
///
/// The timer fires at most once per arm and must be re-armed explicitly.
/// A zero duration means "no timeout" and never arms.
#[derive(Debug)]
pub struct Timer {
    key: TimerKey,
    armed: bool,
}

impl Timer {
    pub fn new(key: TimerKey) -> Self {
        Self { key, armed: false }
    }

    pub fn key(&self) -> TimerKey {
        self.key
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Arms (or re-arms, replacing the deadline) the timer.
    pub fn arm<B: EventBase>(&mut self, base: &mut B, after: Duration) {
        if after.is_zero() {
            return;
        }
        base.add_timer(self.key, after);
        self.armed = true;
    }

    pub fn disarm<B: EventBase>(&mut self, base: &mut B) {
        base.remove_timer(self.key);
        self.armed = false;
    }

    /// Consumes an expiry reported by the event base.
    ///
    /// Returns `false` for an expiry that raced with a disarm, which must be
    /// ignored.
    pub fn fire(&mut self) -> bool {
        std::mem::replace(&mut self.armed, false)
    }
}
