//! Environment-driven configuration.
//!
//! Every field is read once at startup: required values fail fast,
//! optional values degrade gracefully (e.g. no columnar mirror configured
//! means the relational store stays authoritative).

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Primary relational store DSN.
    pub database_url: String,
    /// Optional columnar mirror URL (ClickHouse-shaped). When absent,
    /// aggregation always reads the relational store.
    pub columnar_url: Option<String>,
    /// Portal JWT shared secret (12h token lifetime).
    pub portal_jwt_secret: String,
    /// Webhook HMAC signing secret; per-endpoint this is overridden by
    /// `WebhookEndpoint::secret`, this is the fallback for system-level
    /// webhooks (e.g. invariant alerts).
    pub webhook_secret: String,
    /// Default per-tenant ingestion rate limit (events/min).
    pub default_rate_limit_per_minute: u32,
    /// Outbound HTTP timeout for webhooks and provider adapters.
    pub outbound_timeout: Duration,
    /// CORS origins, retained for the (currently undeployed) HTTP layer.
    pub cors_origins: Vec<String>,
}

fn env_var(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("missing required environment variable: {key}"))
}

fn env_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        let default_rate_limit_per_minute = env_var_or("DEFAULT_RATE_LIMIT_PER_MINUTE", "1000")
            .parse()
            .map_err(|_| "DEFAULT_RATE_LIMIT_PER_MINUTE must be a positive integer".to_string())?;

        let timeout_secs: u64 = env_var_or("OUTBOUND_TIMEOUT_SECONDS", "15")
            .parse()
            .map_err(|_| "OUTBOUND_TIMEOUT_SECONDS must be a positive integer".to_string())?;

        Ok(Self {
            database_url: env_var("DATABASE_URL")?,
            columnar_url: env::var("COLUMNAR_STORE_URL").ok(),
            portal_jwt_secret: env_var("PORTAL_JWT_SECRET")?,
            webhook_secret: env_var("WEBHOOK_SECRET")?,
            default_rate_limit_per_minute,
            outbound_timeout: Duration::from_secs(timeout_secs),
            cors_origins: env_var_or("CORS_ORIGINS", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}
