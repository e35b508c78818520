//! Sliding-window rate tracking. A [`QuotaTracker`] holds a time-ordered queue
//! of `(timestamp, amount)` events and answers whether a new event of a given
//! amount would push the sum over the configured maximum within the window.
//!
//! The wall clock is injected through the [`Clock`] trait so tests can drive
//! time deterministically; one-second granularity is all the quota semantics
//! need.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of coarse wall-clock time, in whole seconds.
pub trait Clock: Send + Sync {
    /// the current time in seconds since some fixed epoch
    fn now(&self) -> u64;
}

/// The production clock: seconds since the UNIX epoch.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Lets tests cross quota windows
/// without sleeping.
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// creates a clock frozen at `start` seconds
    pub fn new(start: u64) -> Arc<ManualClock> {
        Arc::new(ManualClock(AtomicU64::new(start)))
    }

    /// moves the clock forward by `secs`
    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tracks usage of one resource for one user: at most `max_amount` may be
/// consumed within any `duration`-second window.
pub struct QuotaTracker {
    max_amount: u64,
    duration: u64,
    events: VecDeque<(u64, u64)>,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    /// creates a tracker allowing `max_amount` per `duration` seconds
    pub fn new(max_amount: u64, duration: u64, clock: Arc<dyn Clock>) -> Self {
        QuotaTracker {
            max_amount,
            duration,
            events: VecDeque::new(),
            clock,
        }
    }

    /// Decides whether an event of `amount` would fit: the sum of amounts for
    /// all events newer than `now - duration`, plus `amount`, must not exceed
    /// the maximum. Never mutates the event queue, so repeated calls at the
    /// same instant agree.
    pub fn check(&self, amount: u64) -> bool {
        let horizon = self.horizon();
        let live: u64 = self
            .events
            .iter()
            .filter(|(t, _)| *t > horizon)
            .map(|(_, a)| a)
            .sum();
        live.saturating_add(amount) <= self.max_amount
    }

    /// Records an event of `amount` at the current time, pruning events that
    /// have aged out of the window.
    pub fn add(&mut self, amount: u64) {
        let horizon = self.horizon();
        while matches!(self.events.front(), Some((t, _)) if *t <= horizon) {
            self.events.pop_front();
        }
        self.events.push_back((self.clock.now(), amount));
    }

    fn horizon(&self) -> u64 {
        self.clock.now().saturating_sub(self.duration)
    }
}
