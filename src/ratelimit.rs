//! In-process rolling-window rate limiter keyed by `(client, path)`.
//!
//! Per-process by design: a multi-process deployment accepts mild
//! over-counting. Stale windows are evicted on a fixed cadence to bound the
//! map.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};

const WINDOW: Duration = Duration::from_secs(60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

pub struct RateLimiter {
    requests_per_minute: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    requests: HashMap<(String, String), Vec<Instant>>,
    last_cleanup: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_minute: usize) -> Self {
        Self {
            requests_per_minute,
            inner: Mutex::new(Inner {
                requests: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Record one request; errors with `RateLimited` when the window budget
    /// is exhausted.
    pub fn check(&self, client: &str, path: &str) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("rate limiter poisoned");

        if now.duration_since(inner.last_cleanup) >= CLEANUP_INTERVAL {
            inner
                .requests
                .retain(|_, stamps| stamps.iter().any(|t| now.duration_since(*t) < WINDOW));
            inner.last_cleanup = now;
        }

        let stamps = inner
            .requests
            .entry((client.to_string(), path.to_string()))
            .or_default();
        stamps.retain(|t| now.duration_since(*t) < WINDOW);

        if stamps.len() >= self.requests_per_minute {
            let oldest = stamps.iter().min().copied().unwrap_or(now);
            let retry_after = WINDOW
                .checked_sub(now.duration_since(oldest))
                .unwrap_or(Duration::ZERO)
                .as_secs()
                .max(1);
            return Err(EngineError::RateLimited {
                limit: self.requests_per_minute,
                retry_after_secs: retry_after,
            });
        }

        stamps.push(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_applies_per_client_and_path() {
        let limiter = RateLimiter::new(2);

        assert!(limiter.check("10.0.0.1", "/analyze").is_ok());
        assert!(limiter.check("10.0.0.1", "/analyze").is_ok());
        let err = limiter.check("10.0.0.1", "/analyze").unwrap_err();
        assert!(matches!(err, EngineError::RateLimited { limit: 2, .. }));

        // Different path and different client both have fresh budgets.
        assert!(limiter.check("10.0.0.1", "/schema").is_ok());
        assert!(limiter.check("10.0.0.2", "/analyze").is_ok());
    }

    #[test]
    fn retry_after_is_positive() {
        let limiter = RateLimiter::new(1);
        limiter.check("c", "/p").unwrap();
        match limiter.check("c", "/p").unwrap_err() {
            EngineError::RateLimited {
                retry_after_secs, ..
            } => assert!(retry_after_secs >= 1),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
