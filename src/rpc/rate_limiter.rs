// src/rpc/rate_limiter.rs
//! Token-bucket admission control shared by every outbound call of one manager.
//!
//! `acquire` never fails: it only delays. Waiters are admitted in arrival order
//! because the bucket lock is a fair (FIFO) async mutex that is held across the
//! refill wait.

use crate::error::{NetError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Maximum burst, in tokens.
    pub capacity: u32,
    /// Tokens added back per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            refill_per_sec: 50.0,
        }
    }
}

impl RateLimiterConfig {
    /// A zero or non-finite refill rate would turn every wait into a panic.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(NetError::ConfigError(
                "rate limiter capacity must be at least 1".to_string(),
            ));
        }
        if !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0 {
            return Err(NetError::ConfigError(format!(
                "rate limiter refill must be a positive number, got {}",
                self.refill_per_sec
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, rate: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        info!(
            "🚦 Initializing rate limiter: capacity {}, refill {}/s",
            config.capacity, config.refill_per_sec
        );
        let state = BucketState {
            tokens: config.capacity as f64,
            last_refill: Instant::now(),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Waits until `count` tokens are available, then debits them.
    ///
    /// A request larger than the bucket waits for a full bucket and drives the
    /// balance negative, which pushes the delay onto the callers behind it.
    pub async fn acquire(&self, count: u32) {
        if count == 0 {
            return;
        }
        let capacity = self.config.capacity as f64;
        let rate = self.config.refill_per_sec;
        let needed = (count as f64).min(capacity);

        let mut state = self.state.lock().await;
        state.refill(capacity, rate);

        if state.tokens < needed {
            let deficit = needed - state.tokens;
            let wait = Duration::from_secs_f64(deficit / rate);
            debug!(
                "⏳ Rate limiter delaying {} token(s) by {:?} (available {:.2})",
                count, wait, state.tokens
            );
            sleep(wait).await;
            state.refill(capacity, rate);
        }

        state.tokens -= count as f64;
    }

    /// Non-waiting variant; debits only if the tokens are there right now.
    pub async fn try_acquire(&self, count: u32) -> bool {
        let mut state = self.state.lock().await;
        state.refill(self.config.capacity as f64, self.config.refill_per_sec);
        if state.tokens >= count as f64 {
            state.tokens -= count as f64;
            true
        } else {
            false
        }
    }

    /// Current balance after a lazy refill. May be negative after an oversized burst.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(self.config.capacity as f64, self.config.refill_per_sec);
        state.tokens
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::sync::Arc;

    fn limiter(capacity: u32, rate: f64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            capacity,
            refill_per_sec: rate,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_capacity_never_waits() {
        let rl = limiter(10, 10.0);
        let start = Instant::now();
        for _ in 0..10 {
            rl.acquire(1).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_approx_eq!(rl.available().await, 0.0, 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_rate_does_not_accumulate_delay() {
        let rl = limiter(5, 10.0);
        let start = Instant::now();
        for _ in 0..20 {
            rl.acquire(1).await;
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        // Only the explicit advances contributed to elapsed time.
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_above_capacity_is_delayed_not_dropped() {
        let rl = limiter(5, 10.0);
        let start = Instant::now();
        for _ in 0..15 {
            rl.acquire(1).await;
        }
        // 10 tokens beyond the bucket at 10/s
        let elapsed = start.elapsed().as_secs_f64();
        assert!((0.99..=1.05).contains(&elapsed), "elapsed {}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_goes_negative_and_delays_followers() {
        let rl = limiter(4, 4.0);
        let start = Instant::now();
        rl.acquire(8).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_approx_eq!(rl.available().await, -4.0, 1e-9);

        rl.acquire(1).await;
        let elapsed = start.elapsed().as_secs_f64();
        assert!((1.24..=1.26).contains(&elapsed), "elapsed {}", elapsed);
    }

    #[test]
    fn test_config_rejects_unusable_rates() {
        assert!(RateLimiterConfig::default().validate().is_ok());
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = RateLimiterConfig {
                capacity: 10,
                refill_per_sec: rate,
            };
            assert!(
                matches!(config.validate(), Err(NetError::ConfigError(_))),
                "rate {} accepted",
                rate
            );
        }
        let empty = RateLimiterConfig {
            capacity: 0,
            refill_per_sec: 10.0,
        };
        assert!(empty.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_all_admitted() {
        let rl = Arc::new(limiter(2, 20.0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let rl = rl.clone();
            handles.push(tokio::spawn(async move { rl.acquire(1).await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(rl.available().await < 1.0);
        assert!(!rl.try_acquire(2).await);
    }
}
