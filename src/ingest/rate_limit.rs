//! Token bucket limiting how many log lines are processed per unit of time.
//!
//! Tokens refill lazily from elapsed time; there is no background task. The
//! bucket starts full, so a burst of up to `capacity` lines passes at once.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    total_waits: u64,
}

impl RateLimiter {
    /// `tokens` become available every `refill_interval`
    ///
    /// # Panics
    ///
    /// Panics if `tokens` is zero or `refill_interval` is zero.
    pub fn new(tokens: u32, refill_interval: Duration) -> Self {
        assert!(tokens > 0, "tokens must be positive");
        assert!(!refill_interval.is_zero(), "refill_interval must be positive");

        let capacity = f64::from(tokens);
        Self {
            capacity,
            refill_rate: capacity / refill_interval.as_secs_f64(),
            tokens: capacity,
            last_refill: Instant::now(),
            total_waits: 0,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available, without waiting
    pub fn try_acquire(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token is available
    pub fn wait_time(&mut self) -> Duration {
        self.refill(Instant::now());
        let deficit = 1.0 - self.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / self.refill_rate)
        }
    }

    /// Wait until a token is available, then take it
    pub async fn acquire(&mut self) {
        loop {
            if self.try_acquire() {
                return;
            }
            self.total_waits += 1;
            let wait = self.wait_time();
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Number of times a caller had to wait for a token
    pub fn total_waits(&self) -> u64 {
        self.total_waits
    }
}
