//! Coupon, AppliedCoupon.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum CouponType {
    FixedAmount,
    Percentage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum CouponFrequency {
    Once,
    Recurring,
    Forever,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Coupon {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub code: String,
    pub coupon_type: CouponType,
    pub amount_cents: Option<i64>,
    pub percentage_rate: Option<Decimal>,
    pub frequency: CouponFrequency,
    pub frequency_duration: Option<i32>,
    pub reusable: bool,
    pub expiration_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum AppliedCouponStatus {
    Active,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AppliedCoupon {
    pub id: Uuid,
    pub coupon_id: Uuid,
    pub customer_id: Uuid,
    pub status: AppliedCouponStatus,
    pub frequency_duration_remaining: Option<i32>,
    pub created_at: OffsetDateTime,
}

impl AppliedCoupon {
    /// Decrements remaining uses and terminates at 0 for recurring
    /// coupons.
    pub fn decrement_after_use(&mut self, coupon: &Coupon) {
        if coupon.frequency != CouponFrequency::Recurring {
            if coupon.frequency == CouponFrequency::Once {
                self.status = AppliedCouponStatus::Terminated;
            }
            return;
        }

        if let Some(remaining) = self.frequency_duration_remaining {
            let next = remaining.saturating_sub(1).max(0);
            self.frequency_duration_remaining = Some(next);
            if next == 0 {
                self.status = AppliedCouponStatus::Terminated;
            }
        }
    }
}
