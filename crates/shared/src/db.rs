//! Postgres pool bootstrap: a request-serving pool and a narrower
//! single-connection pool for running migrations.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Pool sized for request-serving workloads (API mutations, one
/// connection per in-flight transaction, transaction discipline).
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
}

/// A smaller pool for one-shot tasks (scheduler ticks, migrations) that
/// should not compete with request-serving connections for the pool cap.
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(2)
        .connect(database_url)
        .await
}
