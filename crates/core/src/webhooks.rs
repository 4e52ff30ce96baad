//! Webhook dispatcher: outbox pattern, HMAC-signed delivery,
//! exponential backoff retry. Every delivery attempt is signed with
//! HMAC-SHA256 over the raw payload bytes and sent as `X-Signature`.

use crate::error::CoreResult;
use crate::model::{Webhook, WebhookDeliveryAttempt, WebhookEndpoint, WebhookEndpointStatus, WebhookStatus};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub fn sign_payload(secret: &str, raw_body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(raw_body);
    hex::encode(mac.finalize().into_bytes())
}

/// `base · 2^retries`, capped at 30 minutes.
pub fn backoff_delay(retries: i32, base: Duration) -> Duration {
    let capped_retries = retries.min(20);
    let multiplier = 1u64.checked_shl(capped_retries as u32).unwrap_or(u64::MAX);
    let delay = base.saturating_mul(multiplier.try_into().unwrap_or(u32::MAX));
    delay.min(Duration::from_secs(30 * 60))
}

pub struct WebhookDispatcher {
    pool: PgPool,
    http: reqwest::Client,
    base_backoff: Duration,
}

impl WebhookDispatcher {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            pool,
            http,
            base_backoff: Duration::from_secs(30),
        }
    }

    /// Creates the outbox row for one business event, fanned out to every
    /// active endpoint for the organization; disabled endpoints are
    /// skipped.
    pub async fn enqueue(
        &self,
        organization_id: Uuid,
        endpoints: &[WebhookEndpoint],
        webhook_type: &str,
        object_type: &str,
        object_id: Uuid,
        payload: serde_json::Value,
    ) -> CoreResult<Vec<Webhook>> {
        let now = OffsetDateTime::now_utc();
        let mut created = Vec::new();

        for endpoint in endpoints.iter().filter(|e| e.status == WebhookEndpointStatus::Active) {
            let webhook = Webhook {
                id: Uuid::new_v4(),
                organization_id,
                endpoint_id: endpoint.id,
                webhook_type: webhook_type.to_string(),
                object_type: object_type.to_string(),
                object_id,
                payload: payload.clone(),
                status: WebhookStatus::Pending,
                retries: 0,
                next_attempt_at: now,
                created_at: now,
            };

            sqlx::query(
                "INSERT INTO webhooks (id, organization_id, endpoint_id, webhook_type, object_type, object_id, payload, status, retries, next_attempt_at, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
            )
            .bind(webhook.id)
            .bind(webhook.organization_id)
            .bind(webhook.endpoint_id)
            .bind(&webhook.webhook_type)
            .bind(&webhook.object_type)
            .bind(webhook.object_id)
            .bind(&webhook.payload)
            .bind(webhook.status)
            .bind(webhook.retries)
            .bind(webhook.next_attempt_at)
            .bind(webhook.created_at)
            .execute(&self.pool)
            .await?;

            created.push(webhook);
        }

        Ok(created)
    }

    /// Delivers one webhook to its endpoint, records the attempt, and
    /// schedules the next retry on failure.
    pub async fn deliver(&self, webhook: &mut Webhook, endpoint: &WebhookEndpoint) -> CoreResult<WebhookDeliveryAttempt> {
        let body = serde_json::to_vec(&webhook.payload).unwrap_or_default();
        let signature = sign_payload(&endpoint.secret, &body);

        let response = self
            .http
            .post(&endpoint.url)
            .header("X-Signature", format!("sha256={signature}"))
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await;

        let now = OffsetDateTime::now_utc();
        let (succeeded, response_status) = match &response {
            Ok(resp) => (resp.status().is_success(), Some(resp.status().as_u16() as i32)),
            Err(_) => (false, None),
        };

        let attempt = WebhookDeliveryAttempt {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            attempt_number: webhook.retries + 1,
            response_status,
            succeeded,
            attempted_at: now,
        };

        sqlx::query(
            "INSERT INTO webhook_delivery_attempts (id, webhook_id, attempt_number, response_status, succeeded, attempted_at) VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(attempt.id)
        .bind(attempt.webhook_id)
        .bind(attempt.attempt_number)
        .bind(attempt.response_status)
        .bind(attempt.succeeded)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await?;

        if succeeded {
            webhook.status = WebhookStatus::Success;
            info!(webhook_id = %webhook.id, "webhook delivered");
        } else {
            webhook.retries += 1;
            if webhook.retries < endpoint.max_retries {
                webhook.next_attempt_at = now + backoff_delay(webhook.retries, self.base_backoff);
            } else {
                webhook.status = WebhookStatus::Failed;
                warn!(webhook_id = %webhook.id, retries = webhook.retries, "webhook exhausted retries, raising notification");
            }
        }

        sqlx::query("UPDATE webhooks SET status = $2, retries = $3, next_attempt_at = $4 WHERE id = $1")
            .bind(webhook.id)
            .bind(webhook.status)
            .bind(webhook.retries)
            .bind(webhook.next_attempt_at)
            .execute(&self.pool)
            .await?;

        Ok(attempt)
    }

    pub async fn due_for_retry(&self, organization_id: Uuid, now: OffsetDateTime) -> CoreResult<Vec<Webhook>> {
        let webhooks = sqlx::query_as::<_, Webhook>(
            "SELECT id, organization_id, endpoint_id, webhook_type, object_type, object_id, payload, status, retries, next_attempt_at, created_at FROM webhooks WHERE organization_id = $1 AND status = 'pending' AND next_attempt_at <= $2",
        )
        .bind(organization_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(webhooks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_payload_is_deterministic() {
        let a = sign_payload("secret", b"{}");
        let b = sign_payload("secret", b"{}");
        assert_eq!(a, b);
        assert_ne!(a, sign_payload("other-secret", b"{}"));
    }

    #[test]
    fn backoff_doubles_each_retry() {
        let base = Duration::from_secs(30);
        assert_eq!(backoff_delay(0, base), Duration::from_secs(30));
        assert_eq!(backoff_delay(1, base), Duration::from_secs(60));
        assert_eq!(backoff_delay(2, base), Duration::from_secs(120));
    }

    #[test]
    fn backoff_caps_at_thirty_minutes() {
        let base = Duration::from_secs(30);
        assert_eq!(backoff_delay(30, base), Duration::from_secs(30 * 60));
    }
}
