//! Provisioning gate for the virtualization control plane
//!
//! Concurrent tasks share one hypervisor API. Two limits protect it:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  acquire()                                                        │
//! │     │                                                             │
//! │     ▼                                                             │
//! │  Semaphore ── at most N tasks in Provisioning at once             │
//! │     │                                                             │
//! │     ▼                                                             │
//! │  Token bucket ── at most `rate` clone requests per second,        │
//! │     │            bursts up to `capacity`                          │
//! │     ▼                                                             │
//! │  permit (released when dropped)                                   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

// Tokens are stored * 1000 so fractional refills are not lost
const SCALE: u64 = 1000;

/// Thread-safe token bucket
pub struct RateLimiter {
    /// Maximum tokens in bucket (burst capacity)
    capacity: u64,
    /// Tokens added per second
    refill_rate: f64,
    tokens_scaled: AtomicU64,
    last_refill: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens_scaled: AtomicU64::new(capacity * SCALE),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// Consume one token if available.
    pub fn try_acquire(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens_scaled.load(Ordering::Relaxed);
            if current < SCALE {
                return false;
            }
            if self
                .tokens_scaled
                .compare_exchange(current, current - SCALE, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn refill(&self) {
        let now = Instant::now();
        let mut last = self.last_refill.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = now.duration_since(*last);
        let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate * SCALE as f64) as u64;

        if tokens_to_add > 0 {
            *last = now;
            let max_scaled = self.capacity * SCALE;
            loop {
                let current = self.tokens_scaled.load(Ordering::Relaxed);
                let new = std::cmp::min(current + tokens_to_add, max_scaled);
                if self
                    .tokens_scaled
                    .compare_exchange(current, new, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    /// How long until the next token, assuming nobody else takes it.
    pub fn retry_after(&self) -> Duration {
        let current = self.tokens_scaled.load(Ordering::Relaxed);
        if current >= SCALE || self.refill_rate <= 0.0 {
            return Duration::from_millis(10);
        }
        let missing = (SCALE - current) as f64 / SCALE as f64;
        Duration::from_secs_f64(missing / self.refill_rate).max(Duration::from_millis(10))
    }

    pub fn available_tokens(&self) -> u64 {
        self.tokens_scaled.load(Ordering::Relaxed) / SCALE
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Bounds concurrent provisioning and the rate of clone requests.
pub struct ProvisioningGate {
    permits: Arc<Semaphore>,
    limiter: RateLimiter,
}

impl ProvisioningGate {
    /// `max_concurrent` tasks may provision at once; clone calls are limited
    /// to `per_second` with bursts of `burst`.
    pub fn new(max_concurrent: usize, burst: u64, per_second: f64) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            limiter: RateLimiter::new(burst.max(1), per_second),
        }
    }

    /// Wait for a provisioning slot and a rate token.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        let permit = self.permits.clone().acquire_owned().await?;
        while !self.limiter.try_acquire() {
            let wait = self.limiter.retry_after();
            debug!(wait_ms = wait.as_millis() as u64, "Provisioning rate limited");
            tokio::time::sleep(wait).await;
        }
        Ok(permit)
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}
