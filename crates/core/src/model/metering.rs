//! BillableMetric, BillableMetricFilter, Event, DailyUsage.

use bxb_shared::RoundingFunction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    Count,
    Sum,
    Max,
    UniqueCount,
    WeightedSum,
    Latest,
    Custom,
}

impl AggregationType {
    /// `field_name` is required for every aggregation type except `count`.
    pub fn requires_field_name(&self) -> bool {
        !matches!(self, AggregationType::Count | AggregationType::Custom)
    }

    /// `recurring` is only a valid flag for count/max/latest.
    pub fn supports_recurring(&self) -> bool {
        matches!(
            self,
            AggregationType::Count | AggregationType::Max | AggregationType::Latest
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillableMetric {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Tenant-unique code, e.g. "api_calls".
    pub code: String,
    pub aggregation_type: AggregationType,
    pub field_name: Option<String>,
    pub recurring: bool,
    pub rounding_function: Option<RoundingFunction>,
    pub rounding_precision: Option<u32>,
    /// Required when `aggregation_type == Custom` (reserved; no expression
    /// evaluator is wired up yet).
    pub expression: Option<String>,
}

impl BillableMetric {
    pub fn validate(&self) -> Result<(), String> {
        if self.aggregation_type.requires_field_name() && self.field_name.is_none() {
            return Err(format!(
                "metric '{}': field_name is required for aggregation_type {:?}",
                self.code, self.aggregation_type
            ));
        }
        if self.recurring && !self.aggregation_type.supports_recurring() {
            return Err(format!(
                "metric '{}': recurring is only valid with count/max/latest",
                self.code
            ));
        }
        if matches!(self.aggregation_type, AggregationType::Custom) && self.expression.is_none() {
            return Err(format!(
                "metric '{}': expression is required for custom aggregation",
                self.code
            ));
        }
        Ok(())
    }
}

/// `(metric, key, values[])`, unique on `(metric, key)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillableMetricFilter {
    pub id: Uuid,
    pub billable_metric_id: Uuid,
    pub key: String,
    pub values: Vec<String>,
}

/// Append-only usage event. `transaction_id` is unique per organization
/// (Event uniqueness invariant).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub transaction_id: String,
    pub external_customer_id: String,
    pub code: String,
    pub timestamp: OffsetDateTime,
    pub properties: serde_json::Value,
}

impl Event {
    /// Read a numeric property as an exact decimal, the only point where
    /// the free-form JSON property bag is projected into pricing math.
    pub fn numeric_property(&self, field_name: &str) -> Option<rust_decimal::Decimal> {
        use rust_decimal::prelude::*;
        let value = self.properties.get(field_name)?;
        match value {
            serde_json::Value::Number(n) => {
                Decimal::from_str(&n.to_string()).ok().or_else(|| n.as_f64().and_then(Decimal::from_f64))
            }
            serde_json::Value::String(s) => Decimal::from_str(s).ok(),
            _ => None,
        }
    }

    pub fn string_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key)?.as_str()
    }

    /// Ordered snapshot of string-valued properties, used by charge-filter
    /// matching.
    pub fn property_map(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let serde_json::Value::Object(map) = &self.properties {
            for (k, v) in map {
                let s = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.insert(k.clone(), s);
            }
        }
        out
    }
}

/// Pre-aggregated `(subscription, metric, date) -> (usage_value, events_count)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DailyUsage {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub billable_metric_id: Uuid,
    pub usage_date: time::Date,
    pub usage_value: rust_decimal::Decimal,
    pub events_count: i64,
}
