//! Explicit runtime context: every service takes its dependencies as
//! constructor arguments rather than reaching for a static.
//!
//! Every service in this crate takes its dependencies as constructor
//! arguments rather than reaching for a static; `Runtime` is just the one
//! place that owns the shared ones (pool, rate limiter, HTTP client
//! config) so callers build it once at startup.

use crate::providers::PaymentProvider;
use crate::rate_limit::RateLimiter;
use bxb_shared::Config;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

pub struct Runtime {
    pub pool: PgPool,
    pub config: Config,
    pub rate_limiter: Arc<RateLimiter>,
    pub payment_provider: Arc<dyn PaymentProvider>,
    pub outbound_timeout: Duration,
}

impl Runtime {
    pub fn new(pool: PgPool, config: Config, payment_provider: Arc<dyn PaymentProvider>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.default_rate_limit_per_minute));
        let outbound_timeout = config.outbound_timeout;
        Self {
            pool,
            config,
            rate_limiter,
            payment_provider,
            outbound_timeout,
        }
    }
}
