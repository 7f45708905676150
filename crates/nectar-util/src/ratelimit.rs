//! Token-bucket rate limiting for background I/O.
//!
//! The writeback thread must not monopolise disk bandwidth, and the prefetch
//! thread must not stall lookups that triggered a lazy page-in. Both share
//! this limiter type in different modes: [`RateLimiter::sleep_for`] blocks
//! until the charge is covered, [`RateLimiter::borrow`] charges without
//! blocking and lets the balance go negative, slowing only *future* callers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Balance {
    tokens: f64,
    refreshed: Instant,
}

/// A token bucket refilled continuously at a fixed rate.
///
/// The burst capacity equals one second of refill.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    balance: Mutex<Balance>,
}

impl RateLimiter {
    /// Create a limiter refilled at `rate` units per second.
    pub fn new(rate: f64) -> Self {
        assert!(rate > 0.0, "rate limiter rate must be positive");
        Self {
            rate,
            balance: Mutex::new(Balance {
                tokens: rate,
                refreshed: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn refill(&self, balance: &mut Balance) {
        let now = Instant::now();
        let elapsed = now.duration_since(balance.refreshed).as_secs_f64();
        balance.refreshed = now;
        // Burst cap is one second of refill
        balance.tokens = (balance.tokens + elapsed * self.rate).min(self.rate);
    }

    /// Charge `cost` units, sleeping as long as needed to cover the debt.
    pub fn sleep_for(&self, cost: u64) {
        let deficit = {
            let mut balance = self.balance.lock().unwrap();
            self.refill(&mut balance);
            balance.tokens -= cost as f64;
            -balance.tokens
        };
        if deficit > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(deficit / self.rate));
        }
    }

    /// Charge `cost` units without blocking. The balance may go negative;
    /// subsequent `sleep_for` callers absorb the accumulated debt.
    pub fn borrow(&self, cost: u64) {
        let mut balance = self.balance.lock().unwrap();
        self.refill(&mut balance);
        balance.tokens -= cost as f64;
    }

    /// Current token balance (may be negative after `borrow`).
    pub fn tokens(&self) -> f64 {
        let mut balance = self.balance.lock().unwrap();
        self.refill(&mut balance);
        balance.tokens
    }
}
