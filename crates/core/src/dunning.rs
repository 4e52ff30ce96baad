//! Dunning & Payment-Request Controller: one state machine per
//! `(customer, currency)` over finalized-unpaid invoices.

use crate::error::{CoreError, CoreResult};
use crate::model::{
    DunningCampaign, DunningCampaignThreshold, Invoice, InvoiceSettlement, InvoiceStatus,
    PaymentRequest, PaymentRequestInvoice, PaymentRequestStatus, SettlementSource,
};
use bxb_shared::Currency;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

pub struct DunningController {
    pool: PgPool,
}

/// Finalized, unpaid, past-due invoices for a `(customer, currency)` pair.
pub fn candidate_invoices(invoices: &[Invoice], customer_id: Uuid, currency: Currency, now: OffsetDateTime) -> Vec<Invoice> {
    invoices
        .iter()
        .filter(|inv| {
            inv.customer_id == customer_id
                && inv.currency == currency
                && inv.status == InvoiceStatus::Finalized
                && inv.due_date.map(|due| now > due).unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Whether the outstanding total for a candidate set meets the campaign's
/// per-currency threshold.
pub fn meets_threshold(candidates: &[Invoice], threshold: &DunningCampaignThreshold) -> bool {
    let outstanding: i64 = candidates.iter().map(|inv| inv.total_cents).sum();
    outstanding >= threshold.amount_cents
}

impl DunningController {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a `PaymentRequest` for the candidate invoices unless a
    /// non-failed one already covers them (exclusions).
    pub async fn create_payment_request(
        &self,
        organization_id: Uuid,
        customer_id: Uuid,
        currency: Currency,
        candidates: &[Invoice],
        existing_non_failed: &[PaymentRequest],
    ) -> CoreResult<Option<PaymentRequest>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        if !existing_non_failed.is_empty() {
            return Ok(None);
        }

        let amount_cents: i64 = candidates.iter().map(|inv| inv.total_cents).sum();

        let pr = PaymentRequest {
            id: Uuid::new_v4(),
            organization_id,
            customer_id,
            currency,
            amount_cents,
            payment_attempts: 0,
            payment_status: PaymentRequestStatus::Pending,
            last_attempt_at: None,
            created_at: OffsetDateTime::now_utc(),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO payment_requests (id, organization_id, customer_id, currency, amount_cents, payment_attempts, payment_status, last_attempt_at, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
        )
        .bind(pr.id)
        .bind(pr.organization_id)
        .bind(pr.customer_id)
        .bind(pr.currency)
        .bind(pr.amount_cents)
        .bind(pr.payment_attempts)
        .bind(pr.payment_status)
        .bind(pr.last_attempt_at)
        .bind(pr.created_at)
        .execute(&mut *tx)
        .await?;

        for invoice in candidates {
            let link = PaymentRequestInvoice {
                payment_request_id: pr.id,
                invoice_id: invoice.id,
            };
            sqlx::query("INSERT INTO payment_request_invoices (payment_request_id, invoice_id) VALUES ($1, $2)")
                .bind(link.payment_request_id)
                .bind(link.invoice_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        info!(payment_request_id = %pr.id, customer_id = %customer_id, amount_cents, "payment request created");
        Ok(Some(pr))
    }

    /// One retry-loop step: records attempt outcome, advances attempts,
    /// and either schedules the next attempt or fails the PR permanently.
    pub async fn record_attempt(
        &self,
        mut pr: PaymentRequest,
        campaign: &DunningCampaign,
        succeeded: bool,
        now: OffsetDateTime,
    ) -> CoreResult<PaymentRequest> {
        if pr.payment_status != PaymentRequestStatus::Pending {
            return Err(CoreError::InvalidState(format!(
                "payment request {} is not pending",
                pr.id
            )));
        }

        pr.last_attempt_at = Some(now);

        if succeeded {
            pr.payment_status = PaymentRequestStatus::Succeeded;
        } else {
            pr.payment_attempts += 1;
            if pr.payment_attempts >= campaign.max_attempts {
                pr.payment_status = PaymentRequestStatus::Failed;
            }
        }

        sqlx::query("UPDATE payment_requests SET payment_attempts = $2, payment_status = $3, last_attempt_at = $4 WHERE id = $1")
            .bind(pr.id)
            .bind(pr.payment_attempts)
            .bind(pr.payment_status)
            .bind(pr.last_attempt_at)
            .execute(&self.pool)
            .await?;

        Ok(pr)
    }

    pub fn next_attempt_at(&self, pr: &PaymentRequest, campaign: &DunningCampaign) -> Option<OffsetDateTime> {
        if pr.payment_status != PaymentRequestStatus::Pending {
            return None;
        }
        let last = pr.last_attempt_at?;
        Some(last + time::Duration::days(campaign.days_between_attempts as i64))
    }

    /// Success path: marks the PR succeeded and settles each linked
    /// invoice up to `total_cents` via `InvoiceSettlement(payment, ...)`.
    pub async fn settle_invoices(&self, pr: &PaymentRequest, invoices: &[Invoice]) -> CoreResult<Vec<InvoiceSettlement>> {
        let mut settlements = Vec::with_capacity(invoices.len());
        let mut remaining = pr.amount_cents;

        let mut tx = self.pool.begin().await?;

        for invoice in invoices {
            if remaining <= 0 {
                break;
            }
            let amount = remaining.min(invoice.total_cents);

            let settlement = InvoiceSettlement {
                id: Uuid::new_v4(),
                invoice_id: invoice.id,
                source: SettlementSource::Payment,
                source_id: pr.id,
                amount_cents: amount,
                created_at: OffsetDateTime::now_utc(),
            };

            sqlx::query("INSERT INTO invoice_settlements (id, invoice_id, source, source_id, amount_cents, created_at) VALUES ($1,$2,$3,$4,$5,$6)")
                .bind(settlement.id)
                .bind(settlement.invoice_id)
                .bind(settlement.source)
                .bind(settlement.source_id)
                .bind(settlement.amount_cents)
                .bind(settlement.created_at)
                .execute(&mut *tx)
                .await?;

            remaining -= amount;
            settlements.push(settlement);
        }

        tx.commit().await?;
        Ok(settlements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use uuid::Uuid;

    fn invoice(customer_id: Uuid, currency: Currency, status: InvoiceStatus, due_date: OffsetDateTime, total_cents: i64) -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            customer_id,
            subscription_id: None,
            invoice_number: Some("BXB-1".into()),
            status,
            invoice_type: crate::model::InvoiceType::Subscription,
            period_start: datetime!(2026-01-01 00:00:00 UTC),
            period_end: datetime!(2026-02-01 00:00:00 UTC),
            currency,
            subtotal_cents: total_cents,
            coupons_amount_cents: 0,
            prepaid_credit_amount_cents: 0,
            progressive_billing_credit_amount_cents: 0,
            tax_amount_cents: 0,
            total_cents,
            line_items: None,
            due_date: Some(due_date),
            issued_at: None,
            paid_at: None,
        }
    }

    #[test]
    fn candidate_invoices_requires_past_due_and_finalized() {
        let customer_id = Uuid::new_v4();
        let now = datetime!(2026-06-01 00:00:00 UTC);

        let past_due = invoice(customer_id, Currency::Usd, InvoiceStatus::Finalized, datetime!(2026-05-01 00:00:00 UTC), 1_000);
        let not_due_yet = invoice(customer_id, Currency::Usd, InvoiceStatus::Finalized, datetime!(2026-07-01 00:00:00 UTC), 1_000);
        let draft = invoice(customer_id, Currency::Usd, InvoiceStatus::Draft, datetime!(2026-05-01 00:00:00 UTC), 1_000);

        let candidates = candidate_invoices(&[past_due.clone(), not_due_yet, draft], customer_id, Currency::Usd, now);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, past_due.id);
    }

    #[test]
    fn threshold_test_sums_outstanding() {
        let customer_id = Uuid::new_v4();
        let due = datetime!(2026-05-01 00:00:00 UTC);
        let invoices = vec![
            invoice(customer_id, Currency::Usd, InvoiceStatus::Finalized, due, 3_000),
            invoice(customer_id, Currency::Usd, InvoiceStatus::Finalized, due, 4_000),
        ];
        let threshold = DunningCampaignThreshold {
            id: Uuid::new_v4(),
            dunning_campaign_id: Uuid::new_v4(),
            currency: Currency::Usd,
            amount_cents: 5_000,
        };
        assert!(meets_threshold(&invoices, &threshold));

        let threshold_too_high = DunningCampaignThreshold {
            amount_cents: 10_000,
            ..threshold
        };
        assert!(!meets_threshold(&invoices, &threshold_too_high));
    }
}
