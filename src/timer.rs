//! System timer — tick-resolution time base
//!
//! The kernel counts ticks delivered by the periodic timer interrupt.
//! Timeouts and sleeps are expressed as absolute tick deadlines so that a
//! re-polled wait sees the same deadline it armed.
//!
//! Author: Moroya Sakamoto

/// Kernel time in ticks since boot
pub type Ticks = u64;

/// Outcome marker for a bounded wait that expired
///
/// A timeout is an ordinary result of a bounded wait, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

/// System timer
pub struct SysTimer {
    /// Ticks since boot
    ticks: Ticks,
    /// Tick frequency in Hz
    tick_hz: u32,
}

impl SysTimer {
    /// Create a timer counting at `tick_hz`
    pub const fn new(tick_hz: u32) -> Self {
        Self { ticks: 0, tick_hz }
    }

    /// Advance time by `ticks`
    pub fn advance(&mut self, ticks: Ticks) {
        self.ticks = self.ticks.wrapping_add(ticks);
    }

    /// Current time in ticks
    pub fn now(&self) -> Ticks {
        self.ticks
    }

    /// Current time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.ticks_to_ms(self.ticks)
    }

    /// Tick frequency in Hz
    pub fn tick_hz(&self) -> u32 {
        self.tick_hz
    }

    /// Milliseconds to ticks, rounded up so a non-zero delay never
    /// collapses to zero ticks.
    pub fn ms_to_ticks(&self, ms: u32) -> Ticks {
        let hz = self.tick_hz as u64;
        (ms as u64 * hz).div_ceil(1000)
    }

    /// Ticks to milliseconds
    pub fn ticks_to_ms(&self, ticks: Ticks) -> u64 {
        if self.tick_hz == 0 {
            0
        } else {
            ticks * 1000 / self.tick_hz as u64
        }
    }
}

/// Deadline of one bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    /// When the wait began
    start: Ticks,
    /// Expiry (absolute)
    at: Ticks,
}

impl Deadline {
    /// Deadline `ticks` after `now`
    pub fn after(now: Ticks, ticks: Ticks) -> Self {
        Self {
            start: now,
            at: now.saturating_add(ticks),
        }
    }

    /// Absolute expiry tick
    pub fn at(&self) -> Ticks {
        self.at
    }

    /// Check if the deadline still lies ahead
    pub fn is_met(&self, current: Ticks) -> bool {
        current < self.at
    }

    /// Has the deadline passed?
    pub fn expired(&self, current: Ticks) -> bool {
        !self.is_met(current)
    }

    /// Remaining ticks until expiry (0 if expired)
    pub fn remaining(&self, current: Ticks) -> Ticks {
        self.at.saturating_sub(current)
    }

    /// Elapsed since start
    pub fn elapsed(&self, current: Ticks) -> Ticks {
        current.wrapping_sub(self.start)
    }
}
