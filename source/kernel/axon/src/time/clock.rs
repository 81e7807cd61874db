// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Monotonic microsecond clock advanced by the timekeeper's tick.

/// Tick-driven monotonic time. Only the timekeeper processor advances it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clock {
    now_us: u64,
    ticks: u64,
    period_us: u64,
}

impl Clock {
    pub const fn new(period_us: u64) -> Self {
        Self { now_us: 0, ticks: 0, period_us }
    }

    /// Advances by one period and returns the new time.
    pub fn advance(&mut self) -> u64 {
        self.ticks += 1;
        self.now_us = self.now_us.saturating_add(self.period_us);
        self.now_us
    }

    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn period_us(&self) -> u64 {
        self.period_us
    }
}

/// Point-in-time view of the clock, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSnapshot {
    pub now_us: u64,
    pub ticks: u64,
    /// Raw hardware counter at the time of the snapshot.
    pub hw_ticks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_by_period() {
        let mut clock = Clock::new(10_000);
        assert_eq!(clock.now_us(), 0);
        assert_eq!(clock.advance(), 10_000);
        assert_eq!(clock.advance(), 20_000);
        assert_eq!(clock.ticks(), 2);
    }
}
