//! UsageAlert, UsageAlertTrigger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageAlert {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub billable_metric_id: Uuid,
    pub threshold: Decimal,
    pub recurring: bool,
    pub times_triggered: i32,
    pub triggered_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageAlertTrigger {
    pub id: Uuid,
    pub usage_alert_id: Uuid,
    pub current_value: Decimal,
    pub trigger_count: i32,
    pub triggered_at: OffsetDateTime,
}
