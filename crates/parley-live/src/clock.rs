//! Monotonic audio clocks shared by the scheduler and the output device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonic clock in seconds. Playback start times are expressed on it.
pub trait AudioClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Seconds elapsed since the output device was opened.
#[derive(Debug, Clone, Copy)]
pub struct DeviceClock {
    origin: Instant,
}

impl DeviceClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl AudioClock for DeviceClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock that only moves when told to. Drives deterministic scheduling.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    /// Move the clock forward by `secs`. Negative steps are ignored.
    pub fn advance(&self, secs: f64) {
        if secs <= 0.0 {
            return;
        }
        let now = self.now();
        self.bits.store((now + secs).to_bits(), Ordering::SeqCst);
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::SeqCst);
    }
}

impl AudioClock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_forward() {
        let clock = ManualClock::new(5.0);
        clock.advance(1.5);
        clock.advance(-3.0);
        assert_eq!(clock.now(), 6.5);
    }

    #[test]
    fn device_clock_is_monotonic() {
        let clock = DeviceClock::start();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
