//! Plan, Charge, ChargeFilter, Commitment.

use bxb_shared::{Currency, Money};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum PlanInterval {
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub code: String,
    pub interval: PlanInterval,
    pub amount_cents: i64,
    pub currency: Currency,
    pub trial_period_days: i32,
}

impl Plan {
    /// `amount_cents` is an integer minor-unit column; convert to the
    /// major decimal unit Money operates in.
    pub fn flat_amount(&self) -> Money {
        Money::from_i64(self.amount_cents)
            .checked_div(rust_decimal::Decimal::from(100))
            .unwrap_or(Money::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum ChargeModel {
    Standard,
    Graduated,
    Volume,
    Package,
    Percentage,
    GraduatedPercentage,
}

/// Attaches a `BillableMetric` to a `Plan` with a charge model and JSON
/// model parameters (decoded by `crate::charges`).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Charge {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub billable_metric_id: Uuid,
    pub charge_model: ChargeModel,
    pub properties: serde_json::Value,
}

/// Selects an event subset via `ChargeFilterValue` rows referencing a
/// `BillableMetricFilter`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChargeFilter {
    pub id: Uuid,
    pub charge_id: Uuid,
    /// Insertion order among filters on the same charge; first match wins
    /// when more than one filter could match an event.
    pub position: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChargeFilterValue {
    pub id: Uuid,
    pub charge_filter_id: Uuid,
    pub billable_metric_filter_id: Uuid,
    pub key: String,
    pub value: String,
}

/// Minimum-commit correction fee: the shortfall between a period's metered
/// charges and the plan's minimum commitment, billed as its own fee.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Commitment {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub amount_cents: i64,
    pub invoice_display_name: String,
}
