//! Fixed-window leaky bucket primitive.

use std::time::{Duration, Instant};

/// Token bucket with capacity `C` that refills back to full every period.
/// Callers serialize access externally (the global limiter wraps one of
/// these per token hash behind a mutex).
#[derive(Debug)]
pub struct LeakyBucket {
    capacity: u64,
    period: Duration,
    count: u64,
    window_start: Instant,
}

impl LeakyBucket {
    pub fn new(capacity: u64, period: Duration) -> Self {
        Self {
            capacity,
            period,
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Attempt to add `n` tokens to the bucket. On success the new count is
    /// returned; on overflow the caller gets the instant the current window
    /// resets and should sleep until then before retrying.
    pub fn add(&mut self, n: u64) -> Result<u64, Instant> {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.period {
            self.count = 0;
            self.window_start = now;
        }

        if self.count + n <= self.capacity {
            self.count += n;
            Ok(self.count)
        } else {
            Err(self.window_start + self.period)
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}
