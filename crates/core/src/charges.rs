//! Charge calculators — pure functions from `(units, model
//! parameters)` to an exact-decimal amount. No calculator touches a
//! database or the clock; they are plain associated functions on
//! `ChargeModel`, tested directly without a pool.

use crate::error::{CoreError, CoreResult};
use crate::model::ChargeModel;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// One pricing tier, normalized from either accepted input shape —
/// `graduated_ranges` with `from`/`to`, or `tiers` with `up_to`. Both are
/// accepted on input; this is the one canonical form used internally and
/// re-serialized on output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub from_value: Decimal,
    pub to_value: Option<Decimal>,
    pub per_unit_amount: Decimal,
    pub flat_amount: Decimal,
}

/// Same shape, but the tier boundary is a cumulative `total_amount`
/// threshold and the rate is a percentage rather than a per-unit price
/// (used by `graduated_percentage`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentageTier {
    pub from_value: Decimal,
    pub to_value: Option<Decimal>,
    pub rate_percent: Decimal,
    pub flat_amount: Decimal,
}

fn dec_field(v: &serde_json::Value, key: &str) -> Option<Decimal> {
    match v.get(key)? {
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        serde_json::Value::Number(n) => {
            Decimal::from_str(&n.to_string()).ok().or_else(|| n.as_f64().and_then(Decimal::from_f64))
        }
        _ => None,
    }
}

/// Accepts either `ranges: [{from_value, to_value, per_unit_amount, flat_amount}]`
/// or `tiers: [{up_to, unit_amount, flat_amount}]` on input and normalizes
/// both into one canonical representation.
pub fn parse_tiers(props: &serde_json::Value) -> CoreResult<Vec<Tier>> {
    if let Some(ranges) = props.get("ranges").and_then(|v| v.as_array()) {
        let mut tiers = Vec::with_capacity(ranges.len());
        for r in ranges {
            let from_value = dec_field(r, "from_value").unwrap_or(Decimal::ZERO);
            let to_value = dec_field(r, "to_value");
            let per_unit_amount = dec_field(r, "per_unit_amount")
                .ok_or_else(|| CoreError::Validation("range missing per_unit_amount".into()))?;
            let flat_amount = dec_field(r, "flat_amount").unwrap_or(Decimal::ZERO);
            tiers.push(Tier {
                from_value,
                to_value,
                per_unit_amount,
                flat_amount,
            });
        }
        return Ok(tiers);
    }

    if let Some(raw_tiers) = props.get("tiers").and_then(|v| v.as_array()) {
        let mut tiers = Vec::with_capacity(raw_tiers.len());
        let mut prev_up_to: Option<Decimal> = None;
        for t in raw_tiers {
            let up_to = dec_field(t, "up_to");
            let unit_amount = dec_field(t, "unit_amount")
                .or_else(|| dec_field(t, "unit_price"))
                .ok_or_else(|| CoreError::Validation("tier missing unit_amount".into()))?;
            let flat_amount = dec_field(t, "flat_amount").unwrap_or(Decimal::ZERO);
            let from_value = match prev_up_to {
                Some(p) => p + Decimal::ONE,
                None => Decimal::ZERO,
            };
            tiers.push(Tier {
                from_value,
                to_value: up_to,
                per_unit_amount: unit_amount,
                flat_amount,
            });
            prev_up_to = up_to;
        }
        return Ok(tiers);
    }

    Err(CoreError::Validation(
        "charge properties must contain 'ranges' or 'tiers'".into(),
    ))
}

pub fn parse_percentage_tiers(props: &serde_json::Value) -> CoreResult<Vec<PercentageTier>> {
    let raw_tiers = props
        .get("tiers")
        .and_then(|v| v.as_array())
        .ok_or_else(|| CoreError::Validation("graduated_percentage requires 'tiers'".into()))?;

    let mut tiers = Vec::with_capacity(raw_tiers.len());
    let mut prev_to: Option<Decimal> = None;
    for t in raw_tiers {
        let to_value = dec_field(t, "to_value");
        let rate_percent = dec_field(t, "rate")
            .ok_or_else(|| CoreError::Validation("percentage tier missing rate".into()))?;
        let flat_amount = dec_field(t, "flat_amount").unwrap_or(Decimal::ZERO);
        let from_value = match prev_to {
            Some(p) => p,
            None => Decimal::ZERO,
        };
        tiers.push(PercentageTier {
            from_value,
            to_value,
            rate_percent,
            flat_amount,
        });
        prev_to = to_value;
    }
    Ok(tiers)
}

/// Negative `units` are treated as zero (edge cases).
fn clamp_units(units: Decimal) -> Decimal {
    units.max(Decimal::ZERO)
}

impl ChargeModel {
    pub fn calculate(
        &self,
        units: Decimal,
        total_amount: Decimal,
        events_count: i64,
        properties: &serde_json::Value,
    ) -> CoreResult<Decimal> {
        let units = clamp_units(units);
        match self {
            ChargeModel::Standard => calculate_standard(units, properties),
            ChargeModel::Package => calculate_package(units, properties),
            ChargeModel::Graduated => calculate_graduated(units, properties),
            ChargeModel::Volume => calculate_volume(units, properties),
            ChargeModel::Percentage => {
                calculate_percentage(total_amount, events_count, properties)
            }
            ChargeModel::GraduatedPercentage => {
                calculate_graduated_percentage(total_amount, properties)
            }
        }
    }
}

fn calculate_standard(units: Decimal, properties: &serde_json::Value) -> CoreResult<Decimal> {
    let unit_amount = dec_field(properties, "unit_amount")
        .ok_or_else(|| CoreError::Validation("standard charge missing unit_amount".into()))?;
    Ok((units * unit_amount).round_dp(4))
}

fn calculate_package(units: Decimal, properties: &serde_json::Value) -> CoreResult<Decimal> {
    let amount = dec_field(properties, "amount")
        .ok_or_else(|| CoreError::Validation("package charge missing amount".into()))?;
    let free_units = dec_field(properties, "free_units").unwrap_or(Decimal::ZERO);
    let package_size = dec_field(properties, "package_size").unwrap_or(Decimal::ONE);

    if package_size <= Decimal::ZERO {
        return Err(CoreError::Validation("package_size must be positive".into()));
    }

    let billable_units = (units - free_units).max(Decimal::ZERO);
    if billable_units.is_zero() {
        return Ok(Decimal::ZERO);
    }

    let packages = (billable_units / package_size).ceil();
    Ok((packages * amount).round_dp(4))
}

/// Tiered per-unit pricing: for each tier sorted by `from_value`, charge
/// `units_in_tier * per_unit + flat_amount`. `units_in_tier = min(remaining,
/// to - from + 1)`; the final tier may be open-ended.
fn calculate_graduated(units: Decimal, properties: &serde_json::Value) -> CoreResult<Decimal> {
    let mut tiers = parse_tiers(properties)?;
    if tiers.is_empty() {
        return Ok(Decimal::ZERO);
    }
    tiers.sort_by(|a, b| a.from_value.cmp(&b.from_value));

    let mut remaining = units;
    let mut total = Decimal::ZERO;

    for tier in &tiers {
        if remaining <= Decimal::ZERO {
            break;
        }
        let tier_capacity = match tier.to_value {
            Some(to) => (to - tier.from_value + Decimal::ONE).max(Decimal::ZERO),
            None => remaining,
        };
        let units_in_tier = remaining.min(tier_capacity);
        if units_in_tier <= Decimal::ZERO {
            continue;
        }
        total += units_in_tier * tier.per_unit_amount + tier.flat_amount;
        remaining -= units_in_tier;
    }

    Ok(total.round_dp(4))
}

/// The FIRST tier whose `to_value >= units` (or the last open-ended tier)
/// prices ALL units at that tier's rate plus its flat_amount.
fn calculate_volume(units: Decimal, properties: &serde_json::Value) -> CoreResult<Decimal> {
    let mut tiers = parse_tiers(properties)?;
    if tiers.is_empty() {
        return Ok(Decimal::ZERO);
    }
    tiers.sort_by(|a, b| a.from_value.cmp(&b.from_value));

    let tier = tiers
        .iter()
        .find(|t| t.to_value.map(|to| to >= units).unwrap_or(true))
        .or_else(|| tiers.last())
        .expect("tiers verified non-empty above");

    Ok((units * tier.per_unit_amount + tier.flat_amount).round_dp(4))
}

/// `percentage_fee = total_amount * rate/100`, plus
/// `max(0, event_count - free_units_per_events) * fixed_amount`, with
/// optional per-transaction min/max clamps applied to the sum.
fn calculate_percentage(
    total_amount: Decimal,
    events_count: i64,
    properties: &serde_json::Value,
) -> CoreResult<Decimal> {
    let rate = dec_field(properties, "rate")
        .ok_or_else(|| CoreError::Validation("percentage charge missing rate".into()))?;
    let fixed_amount = dec_field(properties, "fixed_amount").unwrap_or(Decimal::ZERO);
    let free_units_per_events = dec_field(properties, "free_units_per_events").unwrap_or(Decimal::ZERO);
    let min_clamp = dec_field(properties, "per_transaction_min_amount");
    let max_clamp = dec_field(properties, "per_transaction_max_amount");

    let percentage_fee = total_amount * rate / dec!(100);

    let billable_events =
        (Decimal::from(events_count) - free_units_per_events).max(Decimal::ZERO);
    let fixed_fee = billable_events * fixed_amount;

    let mut total = percentage_fee + fixed_fee;
    if let Some(min) = min_clamp {
        total = total.max(min);
    }
    if let Some(max) = max_clamp {
        total = total.min(max);
    }

    Ok(total.round_dp(4))
}

/// Like graduated, but each tier consumes from `total_amount` rather than
/// `units`, charging `portion * rate/100 + flat_amount`.
fn calculate_graduated_percentage(
    total_amount: Decimal,
    properties: &serde_json::Value,
) -> CoreResult<Decimal> {
    let mut tiers = parse_percentage_tiers(properties)?;
    if tiers.is_empty() {
        return Ok(Decimal::ZERO);
    }
    tiers.sort_by(|a, b| a.from_value.cmp(&b.from_value));

    let mut remaining = total_amount.max(Decimal::ZERO);
    let mut total = Decimal::ZERO;

    for tier in &tiers {
        if remaining <= Decimal::ZERO {
            break;
        }
        let tier_capacity = match tier.to_value {
            Some(to) => (to - tier.from_value).max(Decimal::ZERO),
            None => remaining,
        };
        let portion = remaining.min(tier_capacity);
        if portion <= Decimal::ZERO {
            continue;
        }
        total += portion * tier.rate_percent / dec!(100) + tier.flat_amount;
        remaining -= portion;
    }

    Ok(total.round_dp(4))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn units_strategy() -> impl Strategy<Value = Decimal> {
        (0i64..1_000_000).prop_map(Decimal::from)
    }

    proptest! {
        /// Standard is linear: doubling units never more than doubles the fee.
        #[test]
        fn standard_is_monotonic_in_units(a in units_strategy(), b in units_strategy()) {
            let props = json!({ "unit_amount": "1.75" });
            let fee_a = ChargeModel::Standard.calculate(a, Decimal::ZERO, 0, &props).unwrap();
            let fee_b = ChargeModel::Standard.calculate(b, Decimal::ZERO, 0, &props).unwrap();
            if a <= b {
                prop_assert!(fee_a <= fee_b);
            }
        }

        /// A package charge is always an integer multiple of the package amount.
        #[test]
        fn package_fee_is_multiple_of_amount(units in units_strategy()) {
            let props = json!({ "amount": "10", "free_units": "0", "package_size": "7" });
            let fee = ChargeModel::Package.calculate(units, Decimal::ZERO, 0, &props).unwrap();
            let packages = fee / dec!(10);
            prop_assert_eq!(packages.round_dp(0), packages);
        }

        /// Graduated pricing is monotonic non-decreasing as units grow: no
        /// later tier can make the running total go down.
        #[test]
        fn graduated_is_monotonic_in_units(extra in 0i64..500) {
            let props = json!({
                "ranges": [
                    { "from_value": "0", "to_value": "100", "per_unit_amount": "1", "flat_amount": "0" },
                    { "from_value": "101", "to_value": null, "per_unit_amount": "0.5", "flat_amount": "0" }
                ]
            });
            let base = dec!(50);
            let grown = base + Decimal::from(extra);
            let fee_base = ChargeModel::Graduated.calculate(base, Decimal::ZERO, 0, &props).unwrap();
            let fee_grown = ChargeModel::Graduated.calculate(grown, Decimal::ZERO, 0, &props).unwrap();
            prop_assert!(fee_grown >= fee_base);
        }

        /// Negative input is always clamped to zero units regardless of
        /// charge model, so the fee can never be negative from this alone.
        #[test]
        fn negative_units_never_negative_fee(magnitude in 1i64..1_000_000) {
            let props = json!({ "unit_amount": "3" });
            let fee = ChargeModel::Standard
                .calculate(Decimal::from(-magnitude), Decimal::ZERO, 0, &props)
                .unwrap();
            prop_assert_eq!(fee, Decimal::ZERO);
        }
    }
}
