//! Usage-Alert Evaluator: non-recurring alerts fire once;
//! recurring alerts fire once per threshold multiple crossed.

use crate::error::CoreResult;
use crate::model::{UsageAlert, UsageAlertTrigger};
use rust_decimal::prelude::*;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

/// Pure evaluation: given current usage, decides how many NEW triggers to
/// fire and the alert's updated `times_triggered`. Returns `None` when
/// nothing fires.
pub fn evaluate(alert: &UsageAlert, current_value: Decimal) -> Option<(i32, i32)> {
    if alert.recurring {
        if alert.threshold.is_zero() {
            return None;
        }
        let target = (current_value / alert.threshold).floor().to_i32().unwrap_or(0);
        if target > alert.times_triggered {
            let fired = target - alert.times_triggered;
            return Some((fired, target));
        }
        None
    } else {
        if alert.times_triggered > 0 {
            return None;
        }
        if current_value >= alert.threshold {
            Some((1, 1))
        } else {
            None
        }
    }
}

pub struct UsageAlertEvaluator {
    pool: PgPool,
}

impl UsageAlertEvaluator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Evaluates one alert against the current period's usage, persists
    /// any new `UsageAlertTrigger` rows, and returns how many fired (the
    /// caller emits one `usage_alert.triggered` webhook per firing).
    pub async fn evaluate_and_record(&self, alert: &UsageAlert, current_value: Decimal) -> CoreResult<u32> {
        let Some((fired, new_times_triggered)) = evaluate(alert, current_value) else {
            return Ok(0);
        };

        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        for i in 0..fired {
            let trigger = UsageAlertTrigger {
                id: Uuid::new_v4(),
                usage_alert_id: alert.id,
                current_value,
                trigger_count: alert.times_triggered + i + 1,
                triggered_at: now,
            };
            sqlx::query("INSERT INTO usage_alert_triggers (id, usage_alert_id, current_value, trigger_count, triggered_at) VALUES ($1,$2,$3,$4,$5)")
                .bind(trigger.id)
                .bind(trigger.usage_alert_id)
                .bind(trigger.current_value)
                .bind(trigger.trigger_count)
                .bind(trigger.triggered_at)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE usage_alerts SET times_triggered = $2, triggered_at = $3 WHERE id = $1")
            .bind(alert.id)
            .bind(new_times_triggered)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(alert_id = %alert.id, fired, new_times_triggered, "usage alert evaluated");
        Ok(fired as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn alert(threshold: Decimal, recurring: bool, times_triggered: i32) -> UsageAlert {
        UsageAlert {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            billable_metric_id: Uuid::new_v4(),
            threshold,
            recurring,
            times_triggered,
            triggered_at: None,
        }
    }

    #[test]
    fn non_recurring_fires_once_at_threshold() {
        let a = alert(dec!(100), false, 0);
        assert_eq!(evaluate(&a, dec!(100)), Some((1, 1)));
        assert_eq!(evaluate(&a, dec!(99)), None);
    }

    #[test]
    fn non_recurring_does_not_refire() {
        let a = alert(dec!(100), false, 1);
        assert_eq!(evaluate(&a, dec!(500)), None);
    }

    #[test]
    fn recurring_fires_per_multiple_crossed() {
        let a = alert(dec!(100), true, 0);
        assert_eq!(evaluate(&a, dec!(350)), Some((3, 3)));
    }

    #[test]
    fn recurring_fires_incrementally_from_prior_state() {
        let a = alert(dec!(100), true, 3);
        assert_eq!(evaluate(&a, dec!(550)), Some((2, 5)));
        assert_eq!(evaluate(&a, dec!(320)), None);
    }
}
