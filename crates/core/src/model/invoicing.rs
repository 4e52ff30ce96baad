//! Invoice, Fee, InvoiceSettlement.

use bxb_shared::{Currency, Money};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    Paid,
    Voided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    Subscription,
    OneOff,
    /// Modeled as metadata on a subscription invoice rather than a
    /// distinct assembly path.
    ProgressiveBilling,
    CreditNote,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub invoice_number: Option<String>,
    pub status: InvoiceStatus,
    pub invoice_type: InvoiceType,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub currency: Currency,
    pub subtotal_cents: i64,
    pub coupons_amount_cents: i64,
    pub prepaid_credit_amount_cents: i64,
    pub progressive_billing_credit_amount_cents: i64,
    pub tax_amount_cents: i64,
    pub total_cents: i64,
    pub line_items: Option<serde_json::Value>,
    pub due_date: Option<OffsetDateTime>,
    pub issued_at: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
}

impl Invoice {
    /// key invariant: total = subtotal - coupons - prepaid -
    /// progressive + tax, every component >= 0.
    pub fn recompute_total(&mut self) {
        let subtotal = self.subtotal_cents.max(0);
        let coupons = self.coupons_amount_cents.max(0);
        let prepaid = self.prepaid_credit_amount_cents.max(0);
        let progressive = self.progressive_billing_credit_amount_cents.max(0);
        let tax = self.tax_amount_cents.max(0);

        let total = subtotal - coupons - prepaid - progressive + tax;
        self.total_cents = total.max(0);
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self.status, InvoiceStatus::Draft)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum FeeType {
    Charge,
    Subscription,
    AddOn,
    Credit,
    Commitment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
}

/// First-class line item; the materialized result of rating.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Fee {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub fee_type: FeeType,
    pub charge_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub customer_id: Uuid,
    pub commitment_id: Option<Uuid>,
    pub units: rust_decimal::Decimal,
    pub events_count: i64,
    pub unit_amount_cents: i64,
    pub amount_cents: i64,
    pub taxes_amount_cents: i64,
    pub total_amount_cents: i64,
    pub payment_status: PaymentStatus,
    pub created_at: OffsetDateTime,
}

impl Fee {
    /// Ordering key for "within a single invoice, fees are ordered by
    /// (fee_type, then creation)" (Ordering guarantees).
    fn fee_type_rank(&self) -> u8 {
        match self.fee_type {
            FeeType::Subscription => 0,
            FeeType::Charge => 1,
            FeeType::AddOn => 2,
            FeeType::Commitment => 3,
            FeeType::Credit => 4,
        }
    }

    pub fn amount(&self) -> Money {
        Money::from_i64(self.amount_cents)
    }
}

pub fn sort_fees(fees: &mut [Fee]) {
    fees.sort_by(|a, b| {
        a.fee_type_rank()
            .cmp(&b.fee_type_rank())
            .then(a.created_at.cmp(&b.created_at))
    });
}

/// A piece of how much of an invoice's `total_cents` a payment / credit
/// note / wallet credit settled.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvoiceSettlement {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub source: SettlementSource,
    pub source_id: Uuid,
    pub amount_cents: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum SettlementSource {
    Payment,
    CreditNote,
    WalletCredit,
}
