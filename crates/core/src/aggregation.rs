//! Aggregation engine: turns a slice of events into one
//! `(usage_value, events_count)` pair per `(subscription, billable_metric)`
//! for a billing period, and persists the daily rollup used by usage-alert
//! evaluation and invoice preview.
//!
//! The numeric core (`aggregate_events`) is a pure function, kept free of
//! `PgPool` so it can be unit tested directly. `AggregationEngine` is the
//! thin DB-facing wrapper around it.

use crate::error::{CoreError, CoreResult};
use crate::model::{AggregationType, BillableMetric, ChargeFilter, ChargeFilterValue, Event};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::{BTreeSet, HashMap};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatedValue {
    pub usage_value: Decimal,
    pub events_count: i64,
}

impl AggregatedValue {
    pub const ZERO: AggregatedValue = AggregatedValue {
        usage_value: Decimal::ZERO,
        events_count: 0,
    };
}

/// An event matches a `ChargeFilter` when its properties agree with every
/// `ChargeFilterValue` key the filter pins. A filter with no
/// values is the unfiltered fallback and matches everything.
pub fn event_matches_filter(event: &Event, filter_values: &[ChargeFilterValue]) -> bool {
    if filter_values.is_empty() {
        return true;
    }
    let props = event.property_map();
    filter_values
        .iter()
        .all(|fv| props.get(&fv.key).is_some_and(|v| v == &fv.value))
}

pub fn filter_events<'a>(events: &'a [Event], filter_values: &[ChargeFilterValue]) -> Vec<&'a Event> {
    events
        .iter()
        .filter(|e| event_matches_filter(e, filter_values))
        .collect()
}

/// Resolves which of a charge's filters an event falls under: filters are
/// tried in ascending `position` order (lowest wins a tie), and an event
/// matching none falls back to the charge's unfiltered base rate (`None`).
pub fn resolve_charge_filter<'a>(
    event: &Event,
    filters: &'a [ChargeFilter],
    filter_values: &[ChargeFilterValue],
) -> Option<&'a ChargeFilter> {
    let mut ordered: Vec<&ChargeFilter> = filters.iter().collect();
    ordered.sort_by_key(|f| f.position);

    ordered.into_iter().find(|f| {
        let values: Vec<ChargeFilterValue> = filter_values
            .iter()
            .filter(|v| v.charge_filter_id == f.id)
            .cloned()
            .collect();
        !values.is_empty() && event_matches_filter(event, &values)
    })
}

/// Partitions a charge's events across its filters: each event goes to the
/// lowest-`position` filter it matches, or to the unfiltered base (`None`)
/// bucket when no filter matches. One `rate_charge` call per bucket.
pub fn partition_by_charge_filter<'a>(
    events: &'a [Event],
    filters: &[ChargeFilter],
    filter_values: &[ChargeFilterValue],
) -> Vec<(Option<Uuid>, Vec<&'a Event>)> {
    let mut ordered: Vec<&ChargeFilter> = filters.iter().collect();
    ordered.sort_by_key(|f| f.position);

    let mut buckets: Vec<(Option<Uuid>, Vec<&Event>)> =
        ordered.iter().map(|f| (Some(f.id), Vec::new())).collect();
    let mut base = Vec::new();

    for event in events {
        match resolve_charge_filter(event, filters, filter_values) {
            Some(matched) => {
                let bucket = buckets
                    .iter_mut()
                    .find(|(id, _)| *id == Some(matched.id))
                    .expect("bucket pre-seeded for every filter");
                bucket.1.push(event);
            }
            None => base.push(event),
        }
    }

    buckets.push((None, base));
    buckets
}

/// Carry-forward state for a recurring `count`/`max`/`latest` metric: the
/// set of keys still "present" at the end of a period, each with its last
/// observed value. Persisted per `(subscription, billable_metric)` so the
/// next period's aggregation starts from it instead of from zero.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CarriedState {
    pub present_keys: std::collections::BTreeMap<String, Decimal>,
}

impl CarriedState {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// The property identifying which entity a recurring event's presence
/// tracks (e.g. a seat or line-item id) — distinct from `field_name`,
/// which names the numeric property `max`/`latest` reads off that entity.
const RECURRING_KEY_PROPERTY: &str = "item_id";

/// An explicit `operation_type: "remove"` retires a key from the carried
/// set; anything else (including the property's absence) is an add/update.
fn is_recurring_removal(event: &Event) -> bool {
    event.string_property("operation_type") == Some("remove")
}

/// Applies one period's events on top of the carried present-key set for a
/// recurring metric: a key is first-observed in the period the moment it
/// is added (or re-added after removal), and an unmatched key already
/// present just carries its last value forward untouched — this is what
/// lets `max`/`latest` stay non-zero in a period with no new events for an
/// already-billed seat.
fn apply_recurring(
    events: &[&Event],
    metric: &BillableMetric,
    carried: &CarriedState,
) -> CoreResult<(AggregatedValue, CarriedState)> {
    let field = metric.field_name.as_deref();
    let mut present = carried.present_keys.clone();

    let mut sorted: Vec<&&Event> = events.iter().collect();
    sorted.sort_by_key(|e| e.timestamp);

    let mut events_count = 0i64;
    for event in &sorted {
        let Some(key) = event.string_property(RECURRING_KEY_PROPERTY) else {
            continue;
        };
        events_count += 1;

        if is_recurring_removal(event) {
            present.remove(key);
            continue;
        }

        let value = field.and_then(|f| event.numeric_property(f)).unwrap_or(Decimal::ONE);
        present.insert(key.to_string(), value);
    }

    let usage_value = match metric.aggregation_type {
        AggregationType::Count => Decimal::from(present.len() as i64),
        AggregationType::Max => present.values().copied().fold(Decimal::ZERO, Decimal::max),
        AggregationType::Latest => present.values().next_back().copied().unwrap_or(Decimal::ZERO),
        other => {
            return Err(CoreError::Validation(format!(
                "metric '{}': recurring is only valid with count/max/latest, not {other:?}",
                metric.code
            )));
        }
    };

    let usage_value = apply_rounding(usage_value, metric);

    Ok((
        AggregatedValue {
            usage_value,
            events_count,
        },
        CarriedState { present_keys: present },
    ))
}

/// Numeric aggregation over an already-filtered, already-metric-scoped
/// slice of events. For a `recurring` metric, `carried` is the previous
/// period's [`CarriedState`] (or `CarriedState::empty()` for the first
/// period); the returned state is what the caller must persist for the
/// next period.
pub fn aggregate_events(
    events: &[&Event],
    metric: &BillableMetric,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    carried: Option<&CarriedState>,
) -> CoreResult<(AggregatedValue, CarriedState)> {
    if metric.recurring {
        let empty = CarriedState::empty();
        let carried = carried.unwrap_or(&empty);
        return apply_recurring(events, metric, carried);
    }

    let events_count = events.len() as i64;

    let usage_value = match metric.aggregation_type {
        AggregationType::Count => Decimal::from(events_count),

        AggregationType::Sum => {
            let field = require_field(metric)?;
            events
                .iter()
                .filter_map(|e| e.numeric_property(field))
                .sum()
        }

        AggregationType::Max => {
            let field = require_field(metric)?;
            events
                .iter()
                .filter_map(|e| e.numeric_property(field))
                .fold(Decimal::ZERO, |acc, v| acc.max(v))
        }

        AggregationType::UniqueCount => {
            let field = require_field(metric)?;
            let unique: BTreeSet<&str> = events.iter().filter_map(|e| e.string_property(field)).collect();
            Decimal::from(unique.len() as i64)
        }

        AggregationType::Latest => {
            let field = require_field(metric)?;
            let mut sorted: Vec<&&Event> = events.iter().collect();
            sorted.sort_by_key(|e| e.timestamp);
            sorted
                .last()
                .and_then(|e| e.numeric_property(field))
                .unwrap_or(Decimal::ZERO)
        }

        AggregationType::WeightedSum => {
            time_weighted_average(events, metric, period_start, period_end)?
        }

        AggregationType::Custom => {
            return Err(CoreError::Validation(
                "custom aggregation requires an external expression evaluator, none configured".into(),
            ));
        }
    };

    let usage_value = apply_rounding(usage_value, metric);

    Ok((
        AggregatedValue {
            usage_value,
            events_count,
        },
        CarriedState::empty(),
    ))
}

fn require_field(metric: &BillableMetric) -> CoreResult<&str> {
    metric.field_name.as_deref().ok_or_else(|| {
        CoreError::Validation(format!(
            "metric '{}' has no field_name configured for aggregation_type {:?}",
            metric.code, metric.aggregation_type
        ))
    })
}

fn apply_rounding(value: Decimal, metric: &BillableMetric) -> Decimal {
    match metric.rounding_function {
        Some(f) => f.apply(value, metric.rounding_precision.unwrap_or(0)),
        None => value,
    }
}

/// Time-weighted average of `field_name` over `[period_start, period_end)`:
/// each event's value holds until the next event (or the period end), and
/// the result is the duration-weighted mean (`weighted_sum`,
/// modeled after Lago's quantity-over-time metric semantics — the closest
/// domain match in the retrieved example pack).
fn time_weighted_average(
    events: &[&Event],
    metric: &BillableMetric,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
) -> CoreResult<Decimal> {
    let field = require_field(metric)?;
    let total_seconds = (period_end - period_start).whole_seconds();
    if total_seconds <= 0 {
        return Ok(Decimal::ZERO);
    }

    let mut sorted: Vec<&&Event> = events.iter().filter(|e| e.numeric_property(field).is_some()).collect();
    sorted.sort_by_key(|e| e.timestamp);

    if sorted.is_empty() {
        return Ok(Decimal::ZERO);
    }

    let mut weighted_total = Decimal::ZERO;
    for window in sorted.windows(2) {
        let current = window[0];
        let next = window[1];
        let value = current.numeric_property(field).unwrap_or(Decimal::ZERO);
        let held_until = next.timestamp.min(period_end);
        let held_from = current.timestamp.max(period_start);
        let duration = (held_until - held_from).whole_seconds().max(0);
        weighted_total += value * Decimal::from(duration);
    }

    if let Some(last) = sorted.last() {
        let value = last.numeric_property(field).unwrap_or(Decimal::ZERO);
        let held_from = last.timestamp.max(period_start);
        let duration = (period_end - held_from).whole_seconds().max(0);
        weighted_total += value * Decimal::from(duration);
    }

    Ok(weighted_total / Decimal::from(total_seconds))
}

/// DB-facing wrapper: loads events for the period and a metric, persists
/// the per-day rollup used by usage alerts and invoice previews.
pub struct AggregationEngine {
    pool: PgPool,
}

impl AggregationEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn load_events(
        &self,
        organization_id: Uuid,
        external_customer_id: &str,
        metric_code: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> CoreResult<Vec<Event>> {
        let events = sqlx::query_as::<_, Event>(
            r#"
            SELECT id, organization_id, transaction_id, external_customer_id, code, timestamp, properties
            FROM events
            WHERE organization_id = $1
              AND external_customer_id = $2
              AND code = $3
              AND timestamp >= $4
              AND timestamp < $5
            ORDER BY timestamp ASC
            "#,
        )
        .bind(organization_id)
        .bind(external_customer_id)
        .bind(metric_code)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await?;

        debug!(organization_id = %organization_id, metric_code, count = events.len(), "loaded events for aggregation");
        Ok(events)
    }

    /// Writes the `daily_usage` upsert row for one `(subscription, metric,
    /// date)`, the table usage-alert evaluation and invoice previews read
    /// from without re-scanning raw events.
    pub async fn upsert_daily_usage(
        &self,
        subscription_id: Uuid,
        billable_metric_id: Uuid,
        usage_date: time::Date,
        value: AggregatedValue,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_usage (id, subscription_id, billable_metric_id, usage_date, usage_value, events_count)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (subscription_id, billable_metric_id, usage_date)
            DO UPDATE SET usage_value = EXCLUDED.usage_value, events_count = EXCLUDED.events_count
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(billable_metric_id)
        .bind(usage_date)
        .bind(value.usage_value)
        .bind(value.events_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Loads the previous period's [`CarriedState`] for a recurring metric,
    /// `None` on a subscription/metric pair's first invoiced period.
    pub async fn load_carried_state(
        &self,
        subscription_id: Uuid,
        billable_metric_id: Uuid,
    ) -> CoreResult<Option<CarriedState>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT state FROM recurring_usage_state WHERE subscription_id = $1 AND billable_metric_id = $2",
        )
        .bind(subscription_id)
        .bind(billable_metric_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((state,)) => {
                let carried = serde_json::from_value(state)
                    .map_err(|e| CoreError::Validation(format!("corrupt recurring_usage_state row: {e}")))?;
                Ok(Some(carried))
            }
            None => Ok(None),
        }
    }

    /// Persists a recurring metric's carry-forward state for the next
    /// period to read.
    pub async fn store_carried_state(
        &self,
        subscription_id: Uuid,
        billable_metric_id: Uuid,
        state: &CarriedState,
    ) -> CoreResult<()> {
        let state_json = serde_json::to_value(state).map_err(|e| CoreError::Validation(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO recurring_usage_state (subscription_id, billable_metric_id, state)
            VALUES ($1, $2, $3)
            ON CONFLICT (subscription_id, billable_metric_id)
            DO UPDATE SET state = EXCLUDED.state
            "#,
        )
        .bind(subscription_id)
        .bind(billable_metric_id)
        .bind(state_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Rolls every event in a UTC calendar day into `daily_usage`, one row
    /// per `(subscription, metric)` pair observed that day.
    pub async fn daily_rollup(
        &self,
        organization_id: Uuid,
        date: time::Date,
        metrics: &[BillableMetric],
        subscriptions: &HashMap<Uuid, String>,
    ) -> CoreResult<u64> {
        let day_start = date.midnight().assume_utc();
        let day_end = day_start + time::Duration::days(1);
        let mut rollups = 0u64;

        for (subscription_id, external_customer_id) in subscriptions {
            for metric in metrics {
                let events = self
                    .load_events(organization_id, external_customer_id, &metric.code, day_start, day_end)
                    .await?;
                let refs: Vec<&Event> = events.iter().collect();
                // Daily rollups are same-day snapshots for the usage dashboard, not
                // invoicing periods, so recurring metrics roll up without carry-forward
                // (the invoice-period rating pass in `rating.rs` is what carries state).
                let (value, _carried) = aggregate_events(&refs, metric, day_start, day_end, None)?;
                self.upsert_daily_usage(*subscription_id, metric.id, date, value).await?;
                rollups += 1;
            }
        }

        Ok(rollups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn metric(aggregation_type: AggregationType, field_name: Option<&str>) -> BillableMetric {
        BillableMetric {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            code: "test_metric".into(),
            aggregation_type,
            field_name: field_name.map(String::from),
            recurring: false,
            rounding_function: None,
            rounding_precision: None,
            expression: None,
        }
    }

    fn event(timestamp: OffsetDateTime, properties: serde_json::Value) -> Event {
        Event {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4().to_string(),
            external_customer_id: "cust_1".into(),
            code: "test_metric".into(),
            timestamp,
            properties,
        }
    }

    #[test]
    fn count_ignores_properties() {
        let m = metric(AggregationType::Count, None);
        let events = vec![
            event(datetime!(2026-01-01 00:00:00 UTC), json!({})),
            event(datetime!(2026-01-01 01:00:00 UTC), json!({})),
        ];
        let refs: Vec<&Event> = events.iter().collect();
        let (result, _carried) = aggregate_events(
            &refs,
            &m,
            datetime!(2026-01-01 00:00:00 UTC),
            datetime!(2026-01-02 00:00:00 UTC),
            None,
        )
        .unwrap();
        assert_eq!(result.events_count, 2);
        assert_eq!(result.usage_value, Decimal::from(2));
    }

    #[test]
    fn sum_adds_numeric_field() {
        let m = metric(AggregationType::Sum, Some("amount"));
        let events = vec![
            event(datetime!(2026-01-01 00:00:00 UTC), json!({"amount": 10})),
            event(datetime!(2026-01-01 01:00:00 UTC), json!({"amount": 15})),
        ];
        let refs: Vec<&Event> = events.iter().collect();
        let (result, _carried) = aggregate_events(
            &refs,
            &m,
            datetime!(2026-01-01 00:00:00 UTC),
            datetime!(2026-01-02 00:00:00 UTC),
            None,
        )
        .unwrap();
        assert_eq!(result.usage_value, Decimal::from(25));
    }

    #[test]
    fn unique_count_deduplicates() {
        let m = metric(AggregationType::UniqueCount, Some("user_id"));
        let events = vec![
            event(datetime!(2026-01-01 00:00:00 UTC), json!({"user_id": "a"})),
            event(datetime!(2026-01-01 01:00:00 UTC), json!({"user_id": "a"})),
            event(datetime!(2026-01-01 02:00:00 UTC), json!({"user_id": "b"})),
        ];
        let refs: Vec<&Event> = events.iter().collect();
        let (result, _carried) = aggregate_events(
            &refs,
            &m,
            datetime!(2026-01-01 00:00:00 UTC),
            datetime!(2026-01-02 00:00:00 UTC),
            None,
        )
        .unwrap();
        assert_eq!(result.usage_value, Decimal::from(2));
    }

    #[test]
    fn weighted_sum_holds_value_until_next_event() {
        let m = metric(AggregationType::WeightedSum, Some("seats"));
        // 12h at 10 seats, then 12h at 20 seats over a 24h period -> average 15.
        let events = vec![
            event(datetime!(2026-01-01 00:00:00 UTC), json!({"seats": 10})),
            event(datetime!(2026-01-01 12:00:00 UTC), json!({"seats": 20})),
        ];
        let refs: Vec<&Event> = events.iter().collect();
        let (result, _carried) = aggregate_events(
            &refs,
            &m,
            datetime!(2026-01-01 00:00:00 UTC),
            datetime!(2026-01-02 00:00:00 UTC),
            None,
        )
        .unwrap();
        assert_eq!(result.usage_value, Decimal::from(15));
    }

    #[test]
    fn custom_aggregation_is_rejected() {
        let m = metric(AggregationType::Custom, None);
        let result = aggregate_events(
            &[],
            &m,
            datetime!(2026-01-01 00:00:00 UTC),
            datetime!(2026-01-02 00:00:00 UTC),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn recurring_count_carries_present_keys_forward() {
        let mut m = metric(AggregationType::Count, None);
        m.recurring = true;

        let add_seat = event(datetime!(2026-01-01 00:00:00 UTC), json!({"item_id": "seat_1"}));
        let refs: Vec<&Event> = vec![&add_seat];
        let (first, carried) = aggregate_events(
            &refs,
            &m,
            datetime!(2026-01-01 00:00:00 UTC),
            datetime!(2026-02-01 00:00:00 UTC),
            None,
        )
        .unwrap();
        assert_eq!(first.usage_value, Decimal::from(1));
        assert_eq!(carried.present_keys.len(), 1);

        // No events at all in the next period: the seat is still billed.
        let (second, carried) = aggregate_events(
            &[],
            &m,
            datetime!(2026-02-01 00:00:00 UTC),
            datetime!(2026-03-01 00:00:00 UTC),
            Some(&carried),
        )
        .unwrap();
        assert_eq!(second.usage_value, Decimal::from(1));

        let remove_seat = event(
            datetime!(2026-03-05 00:00:00 UTC),
            json!({"item_id": "seat_1", "operation_type": "remove"}),
        );
        let refs: Vec<&Event> = vec![&remove_seat];
        let (third, carried) = aggregate_events(
            &refs,
            &m,
            datetime!(2026-03-01 00:00:00 UTC),
            datetime!(2026-04-01 00:00:00 UTC),
            Some(&carried),
        )
        .unwrap();
        assert_eq!(third.usage_value, Decimal::ZERO);
        assert!(carried.present_keys.is_empty());
    }

    #[test]
    fn filter_matches_require_every_key() {
        let e = event(
            datetime!(2026-01-01 00:00:00 UTC),
            json!({"region": "us", "tier": "gold"}),
        );
        let filters = vec![
            ChargeFilterValue {
                id: Uuid::new_v4(),
                charge_filter_id: Uuid::new_v4(),
                billable_metric_filter_id: Uuid::new_v4(),
                key: "region".into(),
                value: "us".into(),
            },
            ChargeFilterValue {
                id: Uuid::new_v4(),
                charge_filter_id: Uuid::new_v4(),
                billable_metric_filter_id: Uuid::new_v4(),
                key: "tier".into(),
                value: "silver".into(),
            },
        ];
        assert!(!event_matches_filter(&e, &filters));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let e = event(datetime!(2026-01-01 00:00:00 UTC), json!({}));
        assert!(event_matches_filter(&e, &[]));
    }

    fn filter(position: i32) -> ChargeFilter {
        ChargeFilter {
            id: Uuid::new_v4(),
            charge_id: Uuid::new_v4(),
            position,
        }
    }

    fn filter_value(charge_filter_id: Uuid, key: &str, value: &str) -> ChargeFilterValue {
        ChargeFilterValue {
            id: Uuid::new_v4(),
            charge_filter_id,
            billable_metric_filter_id: Uuid::new_v4(),
            key: key.into(),
            value: value.into(),
        }
    }

    #[test]
    fn resolve_charge_filter_picks_lowest_position_match() {
        let broad = filter(1);
        let narrow = filter(0);
        let filters = vec![broad.clone(), narrow.clone()];
        let values = vec![
            filter_value(broad.id, "region", "us"),
            filter_value(narrow.id, "region", "us"),
            filter_value(narrow.id, "tier", "gold"),
        ];
        let e = event(
            datetime!(2026-01-01 00:00:00 UTC),
            json!({"region": "us", "tier": "gold"}),
        );

        let resolved = resolve_charge_filter(&e, &filters, &values).unwrap();
        assert_eq!(resolved.id, narrow.id);
    }

    #[test]
    fn resolve_charge_filter_none_when_no_filter_matches() {
        let f = filter(0);
        let filters = vec![f.clone()];
        let values = vec![filter_value(f.id, "region", "eu")];
        let e = event(datetime!(2026-01-01 00:00:00 UTC), json!({"region": "us"}));

        assert!(resolve_charge_filter(&e, &filters, &values).is_none());
    }

    #[test]
    fn partition_by_charge_filter_buckets_and_falls_back_to_base() {
        let f = filter(0);
        let filters = vec![f.clone()];
        let values = vec![filter_value(f.id, "region", "us")];
        let events = vec![
            event(datetime!(2026-01-01 00:00:00 UTC), json!({"region": "us"})),
            event(datetime!(2026-01-01 01:00:00 UTC), json!({"region": "eu"})),
        ];

        let buckets = partition_by_charge_filter(&events, &filters, &values);
        let matched = buckets.iter().find(|(id, _)| *id == Some(f.id)).unwrap();
        let base = buckets.iter().find(|(id, _)| id.is_none()).unwrap();
        assert_eq!(matched.1.len(), 1);
        assert_eq!(base.1.len(), 1);
    }
}
