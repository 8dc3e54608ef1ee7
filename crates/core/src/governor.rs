//! Token-bucket admission per (source, tenant) pair.
//!
//! Buckets are created lazily on first touch and live for the process
//! lifetime; token state is shared by every in-flight query of the same
//! tenant against the same source. Refill happens lazily inside the
//! admission critical section, which is a plain mutex held only around
//! refill + test-and-consume — never across IO.

use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;

/// Snapshot of one bucket for response metadata. Never consumes.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub remaining: u64,
    pub capacity: u32,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: u32, refill_per_second: f64, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_per_second,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Consume one token, or report how long until one is available.
    fn try_consume(&mut self, now: Instant) -> Result<(), u64> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let retry_after_ms = if self.refill_per_second > 0.0 {
                (deficit / self.refill_per_second * 1000.0).ceil() as u64
            } else {
                u64::MAX
            };
            Err(retry_after_ms)
        }
    }

    fn remaining(&mut self, now: Instant) -> u64 {
        self.refill(now);
        self.tokens.floor().max(0.0) as u64
    }
}

#[derive(Default)]
pub struct RateGovernor {
    buckets: DashMap<(String, String), Mutex<Bucket>>,
}

impl RateGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one operation for `(source, tenant)`, consuming a token.
    /// On exhaustion returns the `retry_after_ms` hint.
    pub fn admit(
        &self,
        source: &str,
        tenant: &str,
        capacity: u32,
        refill_per_second: f64,
    ) -> Result<(), u64> {
        let now = Instant::now();
        let cell = self
            .buckets
            .entry((source.to_string(), tenant.to_string()))
            .or_insert_with(|| Mutex::new(Bucket::new(capacity, refill_per_second, now)));

        let mut bucket = cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Descriptor changes (manifest reload) take effect on next admission.
        bucket.capacity = capacity as f64;
        bucket.refill_per_second = refill_per_second;

        let result = bucket.try_consume(now);
        if let Err(retry_after_ms) = result {
            warn!(
                target: "governor",
                source = %source,
                tenant = %tenant,
                retry_after_ms,
                "rate limit exhausted"
            );
        }
        result
    }

    /// Current bucket state without consuming; for response metadata.
    pub fn status(&self, source: &str, tenant: &str, capacity: u32) -> RateLimitStatus {
        let now = Instant::now();
        let remaining = self
            .buckets
            .get(&(source.to_string(), tenant.to_string()))
            .map(|cell| {
                let mut bucket = cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                bucket.remaining(now)
            })
            .unwrap_or(capacity as u64);
        RateLimitStatus {
            remaining,
            capacity,
        }
    }
}
