//! Event store & ingestion. `ingest`/`ingest_batch` are
//! idempotent on `(organization, transaction_id)`: a duplicate is counted,
//! not appended. Kept free of any columnar-mirror-specific SQL beyond the
//! "prefer it for aggregation reads when present" rule.

use crate::error::{CoreError, CoreResult};
use crate::model::Event;
use crate::rate_limit::RateLimiter;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestResult {
    pub ingested: u32,
    pub duplicates: u32,
}

pub struct NewEvent {
    pub transaction_id: String,
    pub external_customer_id: String,
    pub code: String,
    pub timestamp: OffsetDateTime,
    pub properties: serde_json::Value,
}

fn validate(event: &NewEvent) -> CoreResult<()> {
    if event.transaction_id.trim().is_empty() {
        return Err(CoreError::Validation("transaction_id must not be empty".into()));
    }
    if event.code.trim().is_empty() {
        return Err(CoreError::Validation("code must not be empty".into()));
    }
    Ok(())
}

pub struct EventStore {
    pool: PgPool,
    rate_limiter: RateLimiter,
}

impl EventStore {
    pub fn new(pool: PgPool, rate_limiter: RateLimiter) -> Self {
        Self { pool, rate_limiter }
    }

    pub async fn ingest(&self, organization_id: Uuid, event: NewEvent) -> CoreResult<IngestResult> {
        self.ingest_batch(organization_id, vec![event]).await
    }

    /// Idempotent, rate-limited batch ingestion. Duplicates on
    /// `(organization_id, transaction_id)` are silently counted, never an
    /// error; the only terminal errors are validation and rate-limit.
    pub async fn ingest_batch(&self, organization_id: Uuid, events: Vec<NewEvent>) -> CoreResult<IngestResult> {
        if events.len() > MAX_BATCH_SIZE {
            return Err(CoreError::Validation(format!(
                "batch size {} exceeds max {}",
                events.len(),
                MAX_BATCH_SIZE
            )));
        }
        for event in &events {
            validate(event)?;
        }

        self.rate_limiter.check(organization_id, events.len() as u32)?;

        let mut result = IngestResult::default();
        let mut tx = self.pool.begin().await?;

        for event in events {
            let inserted: Option<(Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO events (id, organization_id, transaction_id, external_customer_id, code, timestamp, properties)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (organization_id, transaction_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(organization_id)
            .bind(&event.transaction_id)
            .bind(&event.external_customer_id)
            .bind(&event.code)
            .bind(event.timestamp)
            .bind(&event.properties)
            .fetch_optional(&mut *tx)
            .await?;

            match inserted {
                Some(_) => result.ingested += 1,
                None => {
                    result.duplicates += 1;
                    debug!(organization_id = %organization_id, transaction_id = %event.transaction_id, "duplicate event ignored");
                }
            }
        }

        tx.commit().await?;

        if result.duplicates > 0 {
            warn!(organization_id = %organization_id, duplicates = result.duplicates, "ingest_batch saw duplicates");
        }

        Ok(result)
    }

    pub async fn find_by_transaction_id(&self, organization_id: Uuid, transaction_id: &str) -> CoreResult<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(
            "SELECT id, organization_id, transaction_id, external_customer_id, code, timestamp, properties FROM events WHERE organization_id = $1 AND transaction_id = $2",
        )
        .bind(organization_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }
}

/// Business-significant occurrences other modules (invoicing, dunning,
/// webhooks) raise as they happen. Distinct from metered usage `Event`s:
/// this is not storage, just the call site other modules hook into (the
/// audit-log table itself, if one exists, is out of scope here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    InvoiceFinalized,
    InvoicePaid,
    InvoiceVoided,
    SubscriptionActivated,
    SubscriptionTerminated,
    PaymentRequestCreated,
    PaymentRequestSucceeded,
    PaymentRequestFailed,
    WebhookDelivered,
    WebhookFailed,
}

impl BillingEventType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::InvoiceFinalized => "invoice.finalized",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoiceVoided => "invoice.voided",
            Self::SubscriptionActivated => "subscription.activated",
            Self::SubscriptionTerminated => "subscription.terminated",
            Self::PaymentRequestCreated => "payment_request.created",
            Self::PaymentRequestSucceeded => "payment_request.succeeded",
            Self::PaymentRequestFailed => "payment_request.failed",
            Self::WebhookDelivered => "webhook.delivered",
            Self::WebhookFailed => "webhook.failed",
        }
    }
}

/// In-process, non-persisted event-emission hook: every finalized
/// invoice, trial flip, payment-request transition and webhook delivery
/// outcome is emitted through here as a structured `tracing` event, one
/// place to add a real sink (queue, audit table) without touching every
/// call site.
#[derive(Debug, Clone, Default)]
pub struct BillingEventLogger;

impl BillingEventLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn emit(&self, organization_id: Uuid, event_type: BillingEventType, object_id: Uuid) {
        tracing::info!(
            organization_id = %organization_id,
            event_type = event_type.as_str(),
            object_id = %object_id,
            "billing event"
        );
    }
}

#[cfg(test)]
mod billing_event_logger_tests {
    use super::*;

    #[test]
    fn emit_does_not_panic_without_a_subscriber() {
        let logger = BillingEventLogger::new();
        logger.emit(Uuid::new_v4(), BillingEventType::InvoiceFinalized, Uuid::new_v4());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_transaction_id() {
        let event = NewEvent {
            transaction_id: "".into(),
            external_customer_id: "cust_1".into(),
            code: "api_calls".into(),
            timestamp: OffsetDateTime::now_utc(),
            properties: serde_json::json!({}),
        };
        assert!(validate(&event).is_err());
    }

    #[test]
    fn rejects_empty_code() {
        let event = NewEvent {
            transaction_id: "txn_1".into(),
            external_customer_id: "cust_1".into(),
            code: "".into(),
            timestamp: OffsetDateTime::now_utc(),
            properties: serde_json::json!({}),
        };
        assert!(validate(&event).is_err());
    }

    #[test]
    fn accepts_well_formed_event() {
        let event = NewEvent {
            transaction_id: "txn_1".into(),
            external_customer_id: "cust_1".into(),
            code: "api_calls".into(),
            timestamp: OffsetDateTime::now_utc(),
            properties: serde_json::json!({"count": 1}),
        };
        assert!(validate(&event).is_ok());
    }
}
