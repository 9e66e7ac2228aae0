//! Byte-budget rate limiting for delivery sessions. The budget refills once
//! per clock tick; an exhausted worker sleeps until the next tick.

use std::time::{Duration, Instant};

/// Per-session token bucket. `rate` is bytes per second; zero disables.
pub struct RateLimiter {
    rate: u64,
    budget: u64,
    tick_start: Instant,
}

impl RateLimiter {
    pub fn new(rate: u64) -> RateLimiter {
        RateLimiter { rate, budget: rate, tick_start: Instant::now() }
    }

    pub fn enabled(&self) -> bool {
        self.rate > 0
    }

    /// Effective block size under this limit: never larger than the per-tick
    /// budget, so one write cannot blow through several ticks at once.
    pub fn block_size(&self, configured: usize) -> usize {
        if self.rate == 0 {
            return configured;
        }
        configured.min(self.rate as usize).max(1)
    }

    /// Consume `n` bytes of budget, sleeping into following ticks while the
    /// current one is spent.
    pub fn take(&mut self, n: u64) {
        if self.rate == 0 {
            return;
        }
        let mut left = n;
        loop {
            self.refill();
            if self.budget >= left {
                self.budget -= left;
                return;
            }
            left -= self.budget;
            self.budget = 0;
            let elapsed = self.tick_start.elapsed();
            if elapsed < Duration::from_secs(1) {
                std::thread::sleep(Duration::from_secs(1) - elapsed);
            }
        }
    }

    fn refill(&mut self) {
        if self.tick_start.elapsed() >= Duration::from_secs(1) {
            self.budget = self.rate;
            self.tick_start = Instant::now();
        }
    }
}
