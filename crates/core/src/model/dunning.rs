//! PaymentRequest, DunningCampaign, DunningCampaignThreshold.

use bxb_shared::Currency;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum PaymentRequestStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Groups finalized-unpaid invoices for a customer into one collection
/// attempt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentRequest {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub currency: Currency,
    pub amount_cents: i64,
    pub payment_attempts: i32,
    pub payment_status: PaymentRequestStatus,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentRequestInvoice {
    pub payment_request_id: Uuid,
    pub invoice_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DunningCampaign {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub code: String,
    pub max_attempts: i32,
    pub days_between_attempts: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DunningCampaignThreshold {
    pub id: Uuid,
    pub dunning_campaign_id: Uuid,
    pub currency: Currency,
    pub amount_cents: i64,
}
