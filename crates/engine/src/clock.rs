//! Time source used by the engine.
//!
//! Planning stamps transactions with [`Clock::now`] and the sweeper measures
//! its budget against a [`Deadline`]; both go through the injected clock so
//! tests can move time by hand.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Duration, DurationRound, Utc};

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock, truncated to milliseconds so stored and returned timestamps
/// compare equal.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        now.duration_trunc(Duration::milliseconds(1)).unwrap_or(now)
    }
}

/// Clock that only moves when told to.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Point in time a unit of work must finish by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    at: DateTime<Utc>,
}

impl Deadline {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self { at }
    }

    pub fn after(clock: &dyn Clock, budget: Duration) -> Self {
        Self {
            at: clock.now() + budget,
        }
    }

    /// Time left, negative once the deadline has passed.
    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        self.at - clock.now()
    }

    pub fn has_at_least(&self, clock: &dyn Clock, margin: Duration) -> bool {
        self.remaining(clock) >= margin
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn manual_clock_drives_deadline() {
        let clock = ManualClock::new(Utc.timestamp_opt(1_800_000_000, 0).unwrap());
        let deadline = Deadline::after(&clock, Duration::seconds(30));
        assert!(deadline.has_at_least(&clock, Duration::seconds(10)));

        clock.advance(Duration::seconds(25));
        assert_eq!(deadline.remaining(&clock), Duration::seconds(5));
        assert!(!deadline.has_at_least(&clock, Duration::seconds(10)));
    }
}
