// ai
//! ⏰ Clocks: one source of "now", passed in, never summoned from the ether.
//!
//! 🎬 *[a test asserts that a 48 hour old post scores lower. it passes on Monday.]*
//! *[it fails on the Tuesday daylight saving kicks in. nobody can explain why.]*
//! *[the clock gets injected. the flake is never seen again.]* 🦆
//!
//! Scoring reads the clock once per call. The cache reads it on every lookup.
//! Both take an `Arc<dyn Clock>` so tests can swap in [`ManualClock`] and time-travel.

use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};

/// ⏰ Anything that can tell the time.
pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 🕰️ The wall clock. Production's one and only.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 🧪 A clock that only moves when told to. Deterministic TTL and decay tests live here.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// ⏩ Move time forward (or backward, with a negative delta. we don't judge).
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += delta;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
