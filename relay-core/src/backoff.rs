//! Exponential backoff with jitter, shared by the discovery watcher and the
//! retry executor.
use std::time::Duration;

use rand::Rng;

/// starting delay after a failure
pub const DEFAULT_FLOOR: Duration = Duration::from_millis(10);
/// delays never grow past this
pub const DEFAULT_CAP: Duration = Duration::from_secs(60);

/// Tracks the current delay of an exponential schedule.
///
/// Every step doubles the delay and scales it by a random factor in
/// `[0.5, 1.0]`, capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_FLOOR, DEFAULT_CAP)
    }
}

impl Backoff {
    /// new schedule starting at `floor`
    pub fn new(floor: Duration, cap: Duration) -> Self {
        let cap = cap.max(floor);
        Self {
            floor,
            cap,
            current: floor,
        }
    }

    /// the delay to sleep for right now
    pub fn current(&self) -> Duration {
        self.current
    }

    /// the configured floor
    pub fn floor(&self) -> Duration {
        self.floor
    }

    /// the configured cap
    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// return the delay to sleep for and advance the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = exponential(self.current, self.cap);
        delay
    }

    /// go back to the floor, after a success
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// double `d`, apply jitter, cap the result
pub fn exponential(d: Duration, cap: Duration) -> Duration {
    let doubled = d.saturating_mul(2);
    let jitter = rand::thread_rng().gen_range(0.5..=1.0);
    doubled.mul_f64(jitter).min(cap)
}
