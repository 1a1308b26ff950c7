//! Tick-based byte budget.
//!
//! A [`Throttle`] splits a target rate into per-tick budgets. Integer
//! division would drop `rate % ticks` bytes every second, so the remainder is
//! carried: over any whole second the budgets add up to exactly `rate`.
//!
//! [`Ticker`] paces the ticks on the tokio clock. Missed ticks are skipped
//! rather than replayed, so a stalled writer does not catch up with a burst
//! that the receiver would see as a rate spike. Under
//! `#[tokio::test(start_paused = true)]` the same code runs against tokio's
//! simulated clock.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Per-tick byte budget for a fixed rate.
#[derive(Debug, Clone)]
pub struct Throttle {
    rate: u32,
    ticks_per_second: u32,
    tick: u32,
}

impl Throttle {
    /// Create a throttle releasing `rate` bytes per second over
    /// `ticks_per_second` ticks.
    ///
    /// A tick rate of zero is treated as one tick per second.
    #[must_use]
    pub fn new(rate: u32, ticks_per_second: u32) -> Self {
        Self {
            rate,
            ticks_per_second: ticks_per_second.max(1),
            tick: 0,
        }
    }

    /// Target rate in bytes per second.
    #[must_use]
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Length of one tick.
    #[must_use]
    pub fn period(&self) -> Duration {
        tick_period(self.ticks_per_second)
    }

    /// Largest budget any single tick can release.
    #[must_use]
    pub fn max_budget(&self) -> usize {
        self.rate.div_ceil(self.ticks_per_second) as usize
    }

    /// Budget for the next tick.
    pub fn next_budget(&mut self) -> usize {
        let rate = u64::from(self.rate);
        let ticks = u64::from(self.ticks_per_second);
        let n = u64::from(self.tick);
        let budget = (n + 1) * rate / ticks - n * rate / ticks;
        self.tick = (self.tick + 1) % self.ticks_per_second;
        budget as usize
    }
}

/// Duration of one tick at `ticks_per_second`.
#[must_use]
pub fn tick_period(ticks_per_second: u32) -> Duration {
    Duration::from_secs(1) / ticks_per_second.max(1)
}

/// Paces throttle ticks on the tokio clock.
#[derive(Debug)]
pub struct Ticker {
    interval: Interval,
}

impl Ticker {
    /// Create a ticker whose first tick completes immediately.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    /// Wait for the start of the next tick.
    ///
    /// Cancel safe.
    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}
