//! Time source used by the process manager.
//!
//! The timer driver lives outside this crate. It advances a [`TickClock`]
//! from its interrupt handler; the process manager only ever reads
//! milliseconds through the [`Clock`] trait.

use core::sync::atomic::{AtomicU64, Ordering};

pub trait Clock: Send + Sync {
    /// Milliseconds since boot.
    fn now_ms(&self) -> u64;
}

/// Clock driven by a periodic timer interrupt.
pub struct TickClock {
    ticks: AtomicU64,
    frequency_hz: u64,
}

impl TickClock {
    pub const fn new(frequency_hz: u64) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            frequency_hz,
        }
    }

    /// Called once per timer interrupt.
    #[inline]
    pub fn advance(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Clock for TickClock {
    fn now_ms(&self) -> u64 {
        if self.frequency_hz == 0 {
            return 0;
        }
        self.ticks().saturating_mul(1000) / self.frequency_hz
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Relaxed);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_clock_converts_to_ms() {
        let clock = TickClock::new(100);
        for _ in 0..25 {
            clock.advance();
        }
        assert_eq!(clock.now_ms(), 250);
        assert_eq!(TickClock::new(0).now_ms(), 0);
    }
}
