//! Rating service: combines the aggregation engine and the
//! charge calculators into materialized `Fee` rows, then applies the
//! minimum-commitment correction.
//!
//! Monetary columns on `Fee`/`Invoice` are persisted as integer minor-unit
//! cents (see `model::pricing::Plan::flat_amount`). The charge calculators
//! compute in exact `Decimal` so percentage and
//! tiered math never loses precision mid-calculation; the result is rounded
//! to the nearest cent only once, at the point a `Fee` is materialized
//! (DESIGN.md: "cents at rest, decimal in flight").

use crate::aggregation::{aggregate_events, filter_events, partition_by_charge_filter, CarriedState};
use crate::error::CoreResult;
use crate::model::{
    BillableMetric, Charge, ChargeFilter, ChargeFilterValue, ChargeModel, Commitment, Event, Fee, FeeType,
    PaymentStatus,
};
use rust_decimal::prelude::*;
use time::OffsetDateTime;
use uuid::Uuid;

fn decimal_to_cents(amount: Decimal) -> i64 {
    (amount * Decimal::from(100))
        .round_dp(0)
        .to_i64()
        .unwrap_or(0)
}

pub struct RatingInput<'a> {
    pub invoice_id: Uuid,
    pub subscription_id: Uuid,
    pub customer_id: Uuid,
    pub charge: &'a Charge,
    pub metric: &'a BillableMetric,
    pub filter_values: &'a [ChargeFilterValue],
    pub events: &'a [Event],
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    /// Previous period's carry-forward state for a `recurring` metric.
    /// Ignored for non-recurring metrics; `None` is treated as empty.
    pub carried: Option<&'a CarriedState>,
}

/// Rates one charge against one period's events, producing the materialized
/// `Fee` row a rating pass appends to the invoice draft, plus the metric's
/// updated carry-forward state (empty/unchanged for non-recurring metrics;
/// the caller persists it for the next period when `metric.recurring`).
pub fn rate_charge(input: RatingInput<'_>) -> CoreResult<(Fee, CarriedState)> {
    let matching = filter_events(input.events, input.filter_values);
    let (aggregated, carried_state) = aggregate_events(
        &matching,
        input.metric,
        input.period_start,
        input.period_end,
        input.carried,
    )?;

    let (units_arg, total_amount_arg) = match input.charge.charge_model {
        // Percentage models rate a sum of underlying transaction amounts,
        // not a unit count; the aggregated value IS the total_amount.
        ChargeModel::Percentage | ChargeModel::GraduatedPercentage => {
            (Decimal::ZERO, aggregated.usage_value)
        }
        _ => (aggregated.usage_value, Decimal::ZERO),
    };

    let amount = input.charge.charge_model.calculate(
        units_arg,
        total_amount_arg,
        aggregated.events_count,
        &input.charge.properties,
    )?;
    let amount_cents = decimal_to_cents(amount);

    let unit_amount_cents = if aggregated.usage_value.is_zero() {
        0
    } else {
        decimal_to_cents(amount / aggregated.usage_value)
    };

    Ok((
        Fee {
            id: Uuid::new_v4(),
            invoice_id: input.invoice_id,
            fee_type: FeeType::Charge,
            charge_id: Some(input.charge.id),
            subscription_id: Some(input.subscription_id),
            customer_id: input.customer_id,
            commitment_id: None,
            units: aggregated.usage_value,
            events_count: aggregated.events_count,
            unit_amount_cents,
            amount_cents,
            taxes_amount_cents: 0,
            total_amount_cents: amount_cents,
            payment_status: PaymentStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
        },
        carried_state,
    ))
}

/// Rates one charge across all of its `ChargeFilter`s for a period.
/// Events are partitioned by filter match (ascending `position`, first
/// match wins, per `ChargeFilter::position`'s ordering), and each
/// non-empty bucket becomes its own `Fee`; events matching no filter rate
/// against the charge's unfiltered base.
///
/// Filtered charges on a `recurring` metric are not supported: each
/// bucket rates as a one-shot, non-carrying aggregation (`metric.recurring`
/// carry-forward is validated on construction against a single charge, not
/// per filter bucket).
#[allow(clippy::too_many_arguments)]
pub fn rate_charge_with_filters(
    invoice_id: Uuid,
    subscription_id: Uuid,
    customer_id: Uuid,
    charge: &Charge,
    metric: &BillableMetric,
    filters: &[ChargeFilter],
    filter_values: &[ChargeFilterValue],
    events: &[Event],
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
) -> CoreResult<Vec<Fee>> {
    let buckets = partition_by_charge_filter(events, filters, filter_values);
    let mut fees = Vec::with_capacity(buckets.len());

    for (_, bucket_events) in buckets {
        if bucket_events.is_empty() {
            continue;
        }
        let owned: Vec<Event> = bucket_events.into_iter().cloned().collect();
        let (fee, _carried) = rate_charge(RatingInput {
            invoice_id,
            subscription_id,
            customer_id,
            charge,
            metric,
            filter_values: &[],
            events: &owned,
            period_start,
            period_end,
            carried: None,
        })?;
        fees.push(fee);
    }

    Ok(fees)
}

/// If the sum of a period's charge fees falls short of the plan's minimum
/// commitment, appends a correction `Fee` for the shortfall.
pub fn apply_commitment_correction(
    charge_fees: &[Fee],
    commitment: &Commitment,
    invoice_id: Uuid,
    subscription_id: Uuid,
    customer_id: Uuid,
) -> Option<Fee> {
    let charged_cents: i64 = charge_fees.iter().map(|f| f.amount_cents).sum();
    let shortfall_cents = commitment.amount_cents - charged_cents;

    if shortfall_cents <= 0 {
        return None;
    }

    Some(Fee {
        id: Uuid::new_v4(),
        invoice_id,
        fee_type: FeeType::Commitment,
        charge_id: None,
        subscription_id: Some(subscription_id),
        customer_id,
        commitment_id: Some(commitment.id),
        units: Decimal::ONE,
        events_count: 0,
        unit_amount_cents: shortfall_cents,
        amount_cents: shortfall_cents,
        taxes_amount_cents: 0,
        total_amount_cents: shortfall_cents,
        payment_status: PaymentStatus::Pending,
        created_at: OffsetDateTime::now_utc(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AggregationType, ChargeFilterValue};
    use serde_json::json;
    use time::macros::datetime;

    fn sample_metric() -> BillableMetric {
        BillableMetric {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            code: "api_calls".into(),
            aggregation_type: AggregationType::Count,
            field_name: None,
            recurring: false,
            rounding_function: None,
            rounding_precision: None,
            expression: None,
        }
    }

    fn sample_event(ts: OffsetDateTime) -> Event {
        Event {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4().to_string(),
            external_customer_id: "cust_1".into(),
            code: "api_calls".into(),
            timestamp: ts,
            properties: json!({}),
        }
    }

    #[test]
    fn rates_standard_charge_from_count_aggregation() {
        let metric = sample_metric();
        let charge = Charge {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            billable_metric_id: metric.id,
            charge_model: ChargeModel::Standard,
            properties: json!({ "unit_amount": "0.5" }),
        };
        let events = vec![
            sample_event(datetime!(2026-01-01 00:00:00 UTC)),
            sample_event(datetime!(2026-01-01 01:00:00 UTC)),
        ];

        let (fee, _carried) = rate_charge(RatingInput {
            invoice_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            charge: &charge,
            metric: &metric,
            filter_values: &[],
            events: &events,
            period_start: datetime!(2026-01-01 00:00:00 UTC),
            period_end: datetime!(2026-01-02 00:00:00 UTC),
            carried: None,
        })
        .unwrap();

        assert_eq!(fee.amount_cents, 100);
        assert_eq!(fee.events_count, 2);
    }

    #[test]
    fn recurring_metric_carries_state_across_periods() {
        let metric = BillableMetric {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            code: "seats".into(),
            aggregation_type: AggregationType::Count,
            field_name: None,
            recurring: true,
            rounding_function: None,
            rounding_precision: None,
            expression: None,
        };
        let charge = Charge {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            billable_metric_id: metric.id,
            charge_model: ChargeModel::Standard,
            properties: json!({ "unit_amount": "10" }),
        };

        let mut add_event = sample_event(datetime!(2026-01-01 00:00:00 UTC));
        add_event.properties = json!({"item_id": "seat_1"});

        let (first_fee, carried) = rate_charge(RatingInput {
            invoice_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            charge: &charge,
            metric: &metric,
            filter_values: &[],
            events: &[add_event],
            period_start: datetime!(2026-01-01 00:00:00 UTC),
            period_end: datetime!(2026-02-01 00:00:00 UTC),
            carried: None,
        })
        .unwrap();
        assert_eq!(first_fee.units, Decimal::ONE);

        let (second_fee, _carried) = rate_charge(RatingInput {
            invoice_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            charge: &charge,
            metric: &metric,
            filter_values: &[],
            events: &[],
            period_start: datetime!(2026-02-01 00:00:00 UTC),
            period_end: datetime!(2026-03-01 00:00:00 UTC),
            carried: Some(&carried),
        })
        .unwrap();

        assert_eq!(second_fee.units, Decimal::ONE);
        assert_eq!(second_fee.amount_cents, 1_000);
    }

    #[test]
    fn commitment_correction_covers_shortfall() {
        let commitment = Commitment {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            amount_cents: 10_000,
            invoice_display_name: "Minimum commitment".into(),
        };
        let fee = Fee {
            id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            fee_type: FeeType::Charge,
            charge_id: Some(Uuid::new_v4()),
            subscription_id: Some(Uuid::new_v4()),
            customer_id: Uuid::new_v4(),
            commitment_id: None,
            units: Decimal::ONE,
            events_count: 1,
            unit_amount_cents: 4_000,
            amount_cents: 4_000,
            taxes_amount_cents: 0,
            total_amount_cents: 4_000,
            payment_status: PaymentStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
        };

        let correction = apply_commitment_correction(
            &[fee],
            &commitment,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        )
        .unwrap();

        assert_eq!(correction.amount_cents, 6_000);
        assert_eq!(correction.fee_type, FeeType::Commitment);
    }

    #[test]
    fn rate_charge_with_filters_splits_fees_by_filter() {
        let metric = sample_metric();
        let charge = Charge {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            billable_metric_id: metric.id,
            charge_model: ChargeModel::Standard,
            properties: json!({ "unit_amount": "1" }),
        };
        let us_filter = ChargeFilter {
            id: Uuid::new_v4(),
            charge_id: charge.id,
            position: 0,
        };
        let filters = vec![us_filter.clone()];
        let filter_values = vec![ChargeFilterValue {
            id: Uuid::new_v4(),
            charge_filter_id: us_filter.id,
            billable_metric_filter_id: Uuid::new_v4(),
            key: "region".into(),
            value: "us".into(),
        }];

        let mut us_event = sample_event(datetime!(2026-01-01 00:00:00 UTC));
        us_event.properties = json!({"region": "us"});
        let mut eu_event = sample_event(datetime!(2026-01-01 01:00:00 UTC));
        eu_event.properties = json!({"region": "eu"});

        let fees = rate_charge_with_filters(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            &charge,
            &metric,
            &filters,
            &filter_values,
            &[us_event, eu_event],
            datetime!(2026-01-01 00:00:00 UTC),
            datetime!(2026-01-02 00:00:00 UTC),
        )
        .unwrap();

        assert_eq!(fees.len(), 2);
        assert!(fees.iter().all(|f| f.events_count == 1));
    }

    #[test]
    fn commitment_correction_absent_when_met() {
        let commitment = Commitment {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            amount_cents: 1_000,
            invoice_display_name: "Minimum commitment".into(),
        };
        let fee = Fee {
            id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            fee_type: FeeType::Charge,
            charge_id: Some(Uuid::new_v4()),
            subscription_id: Some(Uuid::new_v4()),
            customer_id: Uuid::new_v4(),
            commitment_id: None,
            units: Decimal::ONE,
            events_count: 1,
            unit_amount_cents: 5_000,
            amount_cents: 5_000,
            taxes_amount_cents: 0,
            total_amount_cents: 5_000,
            payment_status: PaymentStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
        };

        let correction =
            apply_commitment_correction(&[fee], &commitment, Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(correction.is_none());
    }
}
