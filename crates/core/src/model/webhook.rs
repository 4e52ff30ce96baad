//! Webhook, WebhookEndpoint, WebhookDeliveryAttempt.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum WebhookEndpointStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub url: String,
    pub secret: String,
    pub status: WebhookEndpointStatus,
    pub max_retries: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Success,
    Failed,
}

/// Outbox row: one per business event, fanned out to every active
/// endpoint for the organization.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Webhook {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub endpoint_id: Uuid,
    pub webhook_type: String,
    pub object_type: String,
    pub object_id: Uuid,
    pub payload: serde_json::Value,
    pub status: WebhookStatus,
    pub retries: i32,
    pub next_attempt_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookDeliveryAttempt {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub attempt_number: i32,
    pub response_status: Option<i32>,
    pub succeeded: bool,
    pub attempted_at: OffsetDateTime,
}
