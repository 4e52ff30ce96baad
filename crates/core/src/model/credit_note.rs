//! CreditNote, CreditNoteItem.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum CreditNoteStatus {
    Draft,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum CreditNoteSubstatus {
    Pending,
    Available,
    Consumed,
    Voided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum CreditNoteKind {
    /// Applied mid-period to reduce a future invoice (progressive billing
    /// credit).
    Offset,
    /// Straightforward refund/credit against a settled invoice.
    Standard,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditNote {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub invoice_id: Uuid,
    pub kind: CreditNoteKind,
    pub status: CreditNoteStatus,
    /// Reusable-balance portion.
    pub credit_amount_cents: i64,
    pub credit_status: CreditNoteSubstatus,
    /// Cash-back portion.
    pub refund_amount_cents: i64,
    pub refund_status: CreditNoteSubstatus,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditNoteItem {
    pub id: Uuid,
    pub credit_note_id: Uuid,
    pub fee_id: Uuid,
    pub amount_cents: i64,
}
