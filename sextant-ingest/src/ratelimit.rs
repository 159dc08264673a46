//! Per-publisher fetch rate limiting
//!
//! Token buckets keyed by publisher, held in a bounded LRU so a large or
//! hostile publisher set cannot grow the limiter without bound. A zero rate
//! disables limiting.

use lru::LruCache;
use parking_lot::Mutex;
use sextant_core::PeerId;
use std::num::NonZeroUsize;
use std::time::Instant;

const MAX_TRACKED_PUBLISHERS: usize = 1024;

/// Token bucket for one publisher.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    refill_rate: f64,
}

impl TokenBucket {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Try to consume one token, or report how long until one is available.
    fn try_consume(&mut self) -> Result<(), u64> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - self.tokens;
            let retry_after_ms = (needed / self.refill_rate * 1000.0).ceil() as u64;
            Err(retry_after_ms.max(1))
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }
}

/// Per-publisher rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<LruCache<PeerId, TokenBucket>>,
    rate: Mutex<f64>,
}

impl RateLimiter {
    /// `rate` is fetches per second per publisher; zero disables limiting.
    pub fn new(rate: f64) -> Self {
        Self {
            buckets: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_PUBLISHERS).expect("nonzero capacity"),
            )),
            rate: Mutex::new(rate),
        }
    }

    /// Change the rate for all publishers (reload path). Existing buckets
    /// are dropped so the new rate applies immediately.
    pub fn set_rate(&self, rate: f64) {
        *self.rate.lock() = rate;
        self.buckets.lock().clear();
    }

    /// Try to take one fetch token; on denial returns retry-after millis.
    pub fn try_consume(&self, publisher: &PeerId) -> Result<(), u64> {
        let rate = *self.rate.lock();
        if rate <= 0.0 {
            return Ok(());
        }
        let mut buckets = self.buckets.lock();
        let bucket = match buckets.get_mut(publisher) {
            Some(bucket) => bucket,
            None => {
                buckets.put(*publisher, TokenBucket::new(rate.max(1.0), rate));
                buckets.get_mut(publisher).expect("just inserted")
            }
        };
        bucket.try_consume()
    }

    /// Wait until a fetch token is available for the publisher.
    pub async fn acquire(&self, publisher: &PeerId) {
        loop {
            match self.try_consume(publisher) {
                Ok(()) => return,
                Err(retry_ms) => {
                    tokio::time::sleep(std::time::Duration::from_millis(retry_ms)).await;
                }
            }
        }
    }
}
