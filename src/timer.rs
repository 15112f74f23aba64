use std::time::{Duration, Instant};

/// A simple interval timer, used for keep-alives and timeout detection
pub struct Timer {
    duration: Duration,
    last: Instant,
}

impl Timer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            last: Instant::now(),
        }
    }

    /// Whether the configured interval has elapsed since the last reset
    pub fn ringing(&self) -> bool {
        self.ringing_at(Instant::now())
    }

    pub fn ringing_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last) >= self.duration
    }

    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    pub fn reset_at(&mut self, now: Instant) {
        self.last = now;
    }
}
