//! Organization, BillingEntity, Customer.

use bxb_shared::Currency;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Tenant root. Every other table is scoped by `organization_id`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    /// Prefix used when assigning `Invoice.invoice_number` (e.g. "BXB").
    pub invoice_prefix: String,
    pub default_currency: Currency,
    pub webhook_secret: String,
    pub created_at: OffsetDateTime,
}

/// A legal billing profile sitting between `Organization` and `Customer`.
/// A billing-relevant grouping narrower than the whole organization; kept
/// as the concrete owner of invoice numbering sequences and
/// organization-level default taxes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingEntity {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub code: String,
    pub invoice_prefix: String,
    pub default_currency: Currency,
    /// Next value to assign in `<prefix>-<sequence>` invoice numbers.
    pub invoice_sequence: i64,
    pub applied_to_organization_tax_default: bool,
}

/// Tenant-scoped billing counterparty.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Tenant-unique identifier supplied by the caller, e.g. "C1".
    pub external_id: String,
    pub currency: Currency,
    pub timezone: String,
    /// Days added to the computed issue date to get the due date.
    pub invoice_grace_period: i32,
    /// Days from issue date until `Invoice.due_date`.
    pub net_payment_term: i32,
    pub tax_exempt: bool,
    pub created_at: OffsetDateTime,
}
