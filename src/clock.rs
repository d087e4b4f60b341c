//! Wall-clock source for outbox ages and expectation timestamps.
//!
//! Sleeps and deadlines go through `tokio::time`; [`MonotonicClock`] derives
//! wall time from the same source so paused-time tests stay consistent.

use std::fmt::Debug;

use tokio::time::Instant;

use crate::model::UnixTimeMs;

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Wall time anchored once, then advanced by tokio's monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    base: UnixTimeMs,
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(UnixTimeMs::now())
    }

    pub fn starting_at(base: UnixTimeMs) -> Self {
        Self {
            base,
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> UnixTimeMs {
        let elapsed = Instant::now().saturating_duration_since(self.anchor);
        self.base
            .saturating_add_ms(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}
