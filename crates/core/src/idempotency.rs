//! `(organization, idempotency_key)` store: the at-most-once
//! API mutation guarantee. Concurrent requests with the same key either
//! get the cached response or retry until one is recorded.

use crate::error::CoreResult;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InFlight,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub organization_id: Uuid,
    pub idempotency_key: String,
    pub status: IdempotencyStatus,
    pub response_status: Option<i32>,
    pub response_body: Option<serde_json::Value>,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

pub enum Claim {
    /// No prior record existed; caller owns this key and must call
    /// `complete` once the mutation finishes.
    Owner,
    /// A cached response already exists; replay it verbatim.
    Replay(IdempotencyRecord),
    /// Another request is still in flight for this key; caller should
    /// retry after a bounded wait.
    InFlight,
}

pub struct IdempotencyStore {
    pool: PgPool,
    ttl: time::Duration,
}

impl IdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ttl: time::Duration::hours(24),
        }
    }

    /// Attempts to claim a key. Returns `Owner` when this call wins the
    /// race and must perform the mutation; `Replay`/`InFlight` otherwise.
    pub async fn claim(&self, organization_id: Uuid, idempotency_key: &str) -> CoreResult<Claim> {
        let now = OffsetDateTime::now_utc();
        let expires_at = now + self.ttl;

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO idempotency_records (organization_id, idempotency_key, status, created_at, expires_at)
            VALUES ($1, $2, 'in_flight', $3, $4)
            ON CONFLICT (organization_id, idempotency_key) DO NOTHING
            RETURNING organization_id
            "#,
        )
        .bind(organization_id)
        .bind(idempotency_key)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(Claim::Owner);
        }

        let existing = sqlx::query_as::<_, IdempotencyRecord>(
            "SELECT organization_id, idempotency_key, status, response_status, response_body, created_at, expires_at FROM idempotency_records WHERE organization_id = $1 AND idempotency_key = $2",
        )
        .bind(organization_id)
        .bind(idempotency_key)
        .fetch_one(&self.pool)
        .await?;

        match existing.status {
            IdempotencyStatus::Completed => Ok(Claim::Replay(existing)),
            IdempotencyStatus::InFlight => Ok(Claim::InFlight),
        }
    }

    pub async fn complete(
        &self,
        organization_id: Uuid,
        idempotency_key: &str,
        response_status: i32,
        response_body: serde_json::Value,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE idempotency_records SET status = 'completed', response_status = $3, response_body = $4 WHERE organization_id = $1 AND idempotency_key = $2",
        )
        .bind(organization_id)
        .bind(idempotency_key)
        .bind(response_status)
        .bind(response_body)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
