//! Subscription.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Canceled,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum BillingTime {
    Calendar,
    Anniversary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum OnTerminationAction {
    GenerateInvoice,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub external_id: String,
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub billing_time: BillingTime,
    pub trial_period_days: i32,
    pub subscription_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub pay_in_advance: bool,
    pub previous_plan_id: Option<Uuid>,
    pub on_termination_action: OnTerminationAction,
    pub paused_at: Option<OffsetDateTime>,
    pub resumed_at: Option<OffsetDateTime>,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active && self.paused_at.is_none()
    }

    pub fn in_trial(&self, now: OffsetDateTime) -> bool {
        if self.trial_period_days <= 0 {
            return false;
        }
        let trial_end = self.subscription_at + time::Duration::days(self.trial_period_days as i64);
        now < trial_end
    }
}
