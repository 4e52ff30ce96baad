//! Per-tenant sliding-window rate limiter. In-process
//! state under a mutex: "rate-limiter is a per-process
//! sliding window under a mutex; idempotency records are persisted."

use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

const WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_LIMIT_PER_MINUTE: u32 = 1_000;

struct Window {
    started_at: Instant,
    count: u32,
}

pub struct RateLimiter {
    limit_per_minute: u32,
    windows: Mutex<HashMap<Uuid, Window>>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn new_in_memory() -> Self {
        Self::new(DEFAULT_LIMIT_PER_MINUTE)
    }

    /// Checks and charges `n` units against the organization's sliding
    /// window, starting a fresh window once the prior one has elapsed.
    pub fn check(&self, organization_id: Uuid, n: u32) -> CoreResult<()> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let window = windows.entry(organization_id).or_insert_with(|| Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(window.started_at) >= WINDOW {
            window.started_at = now;
            window.count = 0;
        }

        if window.count.saturating_add(n) > self.limit_per_minute {
            let retry_after = WINDOW.saturating_sub(now.duration_since(window.started_at));
            return Err(CoreError::RateLimited {
                retry_after_seconds: retry_after.as_secs().max(1),
            });
        }

        window.count += n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_usage_under_limit() {
        let limiter = RateLimiter::new(10);
        let org = Uuid::new_v4();
        assert!(limiter.check(org, 5).is_ok());
        assert!(limiter.check(org, 5).is_ok());
    }

    #[test]
    fn rejects_usage_over_limit() {
        let limiter = RateLimiter::new(10);
        let org = Uuid::new_v4();
        assert!(limiter.check(org, 10).is_ok());
        assert!(limiter.check(org, 1).is_err());
    }

    #[test]
    fn tenants_are_isolated() {
        let limiter = RateLimiter::new(10);
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        assert!(limiter.check(org_a, 10).is_ok());
        assert!(limiter.check(org_b, 10).is_ok());
    }
}
