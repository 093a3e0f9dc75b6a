//! Monotonic 10 ms tick counter with stopwatch and countdown views.
//!
//! The engine advances the timer once per output frame. Views hold a shared
//! handle to the timer so they can be queried without passing it around.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{NetEqError, Result};

/// Default tick length in milliseconds.
pub const DEFAULT_MS_PER_TICK: u32 = 10;

/// Counts output ticks for one engine instance.
#[derive(Debug)]
pub struct TickTimer {
    ticks: AtomicU64,
    ms_per_tick: u32,
}

impl TickTimer {
    /// Create a timer with the default 10 ms tick.
    pub fn new() -> Arc<Self> {
        Self::build(DEFAULT_MS_PER_TICK)
    }

    /// Create a timer with a custom tick length.
    pub fn with_ms_per_tick(ms_per_tick: u32) -> Result<Arc<Self>> {
        if ms_per_tick == 0 {
            return Err(NetEqError::InvalidConfig("tick length must be positive".to_string()));
        }
        Ok(Self::build(ms_per_tick))
    }

    fn build(ms_per_tick: u32) -> Arc<Self> {
        Arc::new(Self {
            ticks: AtomicU64::new(0),
            ms_per_tick,
        })
    }

    /// Advance by one tick.
    pub fn increment(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Advance by `n` ticks.
    pub fn increment_by(&self, n: u64) {
        self.ticks.fetch_add(n, Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn ms_per_tick(&self) -> u32 {
        self.ms_per_tick
    }

    /// Start a stopwatch at the current tick.
    pub fn new_stopwatch(self: &Arc<Self>) -> Stopwatch {
        Stopwatch {
            timer: Arc::clone(self),
            start_tick: self.ticks(),
        }
    }

    /// Start a countdown that finishes `ticks` ticks from now.
    pub fn new_countdown(self: &Arc<Self>, ticks: u64) -> Countdown {
        Countdown {
            stopwatch: self.new_stopwatch(),
            ticks_to_count: ticks,
        }
    }
}

/// Elapsed time since the stopwatch was started.
#[derive(Debug, Clone)]
pub struct Stopwatch {
    timer: Arc<TickTimer>,
    start_tick: u64,
}

impl Stopwatch {
    pub fn elapsed_ticks(&self) -> u64 {
        self.timer.ticks().saturating_sub(self.start_tick)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ticks() * self.timer.ms_per_tick() as u64
    }

    /// Restart from the current tick.
    pub fn restart(&mut self) {
        self.start_tick = self.timer.ticks();
    }
}

/// Ticks remaining until a deadline.
#[derive(Debug, Clone)]
pub struct Countdown {
    stopwatch: Stopwatch,
    ticks_to_count: u64,
}

impl Countdown {
    pub fn finished(&self) -> bool {
        self.stopwatch.elapsed_ticks() >= self.ticks_to_count
    }

    pub fn remaining_ticks(&self) -> u64 {
        self.ticks_to_count.saturating_sub(self.stopwatch.elapsed_ticks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment() {
        let timer = TickTimer::new();
        assert_eq!(timer.ticks(), 0);
        timer.increment();
        timer.increment_by(4);
        assert_eq!(timer.ticks(), 5);
        assert_eq!(timer.ms_per_tick(), 10);
    }

    #[test]
    fn test_stopwatch() {
        let timer = TickTimer::with_ms_per_tick(20).unwrap();
        timer.increment_by(3);
        let mut sw = timer.new_stopwatch();
        assert_eq!(sw.elapsed_ticks(), 0);
        timer.increment_by(2);
        assert_eq!(sw.elapsed_ticks(), 2);
        assert_eq!(sw.elapsed_ms(), 40);
        sw.restart();
        assert_eq!(sw.elapsed_ticks(), 0);
    }

    #[test]
    fn test_countdown() {
        let timer = TickTimer::new();
        let countdown = timer.new_countdown(3);
        assert!(!countdown.finished());
        assert_eq!(countdown.remaining_ticks(), 3);
        timer.increment_by(2);
        assert!(!countdown.finished());
        timer.increment();
        assert!(countdown.finished());
        assert_eq!(countdown.remaining_ticks(), 0);
    }

    #[test]
    fn test_zero_tick_length_rejected() {
        assert!(matches!(
            TickTimer::with_ms_per_tick(0),
            Err(NetEqError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_countdown_is_finished() {
        let timer = TickTimer::new();
        assert!(timer.new_countdown(0).finished());
    }
}
