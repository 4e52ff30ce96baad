//! Wallet, WalletTransaction.

use bxb_shared::Currency;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Active,
    Terminated,
}

/// Per-customer prepaid credit balance with a rate to currency.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub code: String,
    pub credits_balance: Decimal,
    pub rate_amount: Decimal,
    pub currency: Currency,
    /// 1 is highest priority (step 4: ascending priority then
    /// descending balance).
    pub priority: i32,
    pub expiration_at: Option<OffsetDateTime>,
    pub status: WalletStatus,
}

impl Wallet {
    pub fn is_drawable(&self, now: OffsetDateTime) -> bool {
        self.status == WalletStatus::Active
            && self.expiration_at.map(|exp| now < exp).unwrap_or(true)
            && self.credits_balance > Decimal::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum WalletTransactionType {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Settled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum WalletTransactionStatus {
    Purchased,
    Granted,
    Voided,
    Invoiced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum WalletTransactionSource {
    Manual,
    Interval,
    Threshold,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub transaction_type: WalletTransactionType,
    pub status: SettlementStatus,
    pub transaction_status: WalletTransactionStatus,
    pub source: WalletTransactionSource,
    /// Amount in the wallet's currency.
    pub amount: Decimal,
    /// Amount in credits (`amount = credit_amount * wallet.rate_amount`).
    pub credit_amount: Decimal,
    pub invoice_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}
