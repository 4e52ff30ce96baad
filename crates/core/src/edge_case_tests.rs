#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Engine
//!
//! Boundary conditions that are easy to get off-by-one on:
//! - Rate limiting (BXB-R01 to BXB-R03)
//! - Charge-filter tie-breaks (BXB-F01 to BXB-F02)
//! - Dunning thresholds (BXB-D01 to BXB-D02)
//! - Webhook retry backoff (BXB-W01 to BXB-W02)
//! - Invoice total clamping (BXB-I01 to BXB-I02)

#[cfg(test)]
mod rate_limit_tests {
    use crate::rate_limit::RateLimiter;
    use uuid::Uuid;

    // =========================================================================
    // BXB-R01: nth request at limit=n - should be allowed
    // =========================================================================
    #[test]
    fn request_exactly_at_limit_is_allowed() {
        let limiter = RateLimiter::new(10);
        let org = Uuid::new_v4();
        assert!(limiter.check(org, 10).is_ok());
    }

    // =========================================================================
    // BXB-R02: (n+1)th unit over limit=n - should be rejected
    // =========================================================================
    #[test]
    fn one_unit_over_limit_is_rejected() {
        let limiter = RateLimiter::new(10);
        let org = Uuid::new_v4();
        assert!(limiter.check(org, 10).is_ok());
        assert!(limiter.check(org, 1).is_err());
    }

    // =========================================================================
    // BXB-R03: a batch that itself exceeds the limit is rejected outright,
    // not partially charged
    // =========================================================================
    #[test]
    fn oversized_batch_is_rejected_without_partial_charge() {
        let limiter = RateLimiter::new(10);
        let org = Uuid::new_v4();
        assert!(limiter.check(org, 11).is_err());
        // the rejected batch must not have consumed any of the window
        assert!(limiter.check(org, 10).is_ok());
    }
}

#[cfg(test)]
mod charge_filter_tests {
    use crate::aggregation::resolve_charge_filter;
    use crate::model::{ChargeFilter, ChargeFilterValue, Event};
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn event_with(properties: serde_json::Value) -> Event {
        Event {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            transaction_id: "txn_1".into(),
            external_customer_id: "cust_1".into(),
            code: "api_calls".into(),
            timestamp: OffsetDateTime::now_utc(),
            properties,
        }
    }

    // =========================================================================
    // BXB-F01: event matches two filters - lowest position wins
    // =========================================================================
    #[test]
    fn lowest_position_wins_when_two_filters_match() {
        let charge_id = Uuid::new_v4();
        let low = ChargeFilter { id: Uuid::new_v4(), charge_id, position: 0 };
        let high = ChargeFilter { id: Uuid::new_v4(), charge_id, position: 1 };
        let filters = vec![high.clone(), low.clone()]; // insertion order deliberately reversed

        let values = vec![
            ChargeFilterValue {
                id: Uuid::new_v4(),
                charge_filter_id: low.id,
                billable_metric_filter_id: Uuid::new_v4(),
                key: "region".into(),
                value: "eu".into(),
            },
            ChargeFilterValue {
                id: Uuid::new_v4(),
                charge_filter_id: high.id,
                billable_metric_filter_id: Uuid::new_v4(),
                key: "region".into(),
                value: "eu".into(),
            },
        ];

        let event = event_with(serde_json::json!({"region": "eu"}));
        let matched = resolve_charge_filter(&event, &filters, &values);
        assert_eq!(matched.map(|f| f.id), Some(low.id), "position 0 should win over position 1");
    }

    // =========================================================================
    // BXB-F02: event matches no filter - falls back to the unfiltered base
    // =========================================================================
    #[test]
    fn unmatched_event_falls_back_to_base() {
        let charge_id = Uuid::new_v4();
        let filter = ChargeFilter { id: Uuid::new_v4(), charge_id, position: 0 };
        let values = vec![ChargeFilterValue {
            id: Uuid::new_v4(),
            charge_filter_id: filter.id,
            billable_metric_filter_id: Uuid::new_v4(),
            key: "region".into(),
            value: "eu".into(),
        }];

        let event = event_with(serde_json::json!({"region": "us"}));
        let matched = resolve_charge_filter(&event, &[filter], &values);
        assert!(matched.is_none(), "non-matching region should fall back to base rate");
    }
}

#[cfg(test)]
mod dunning_tests {
    use crate::dunning::meets_threshold;
    use crate::model::{DunningCampaignThreshold, Invoice, InvoiceStatus, InvoiceType};
    use bxb_shared::Currency;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn invoice_with_total(total_cents: i64) -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            subscription_id: None,
            invoice_number: None,
            status: InvoiceStatus::Finalized,
            invoice_type: InvoiceType::Subscription,
            period_start: OffsetDateTime::now_utc(),
            period_end: OffsetDateTime::now_utc(),
            currency: Currency::Usd,
            subtotal_cents: total_cents,
            coupons_amount_cents: 0,
            prepaid_credit_amount_cents: 0,
            progressive_billing_credit_amount_cents: 0,
            tax_amount_cents: 0,
            total_cents,
            line_items: None,
            due_date: None,
            issued_at: None,
            paid_at: None,
        }
    }

    // =========================================================================
    // BXB-D01: outstanding exactly equal to the threshold meets it
    // =========================================================================
    #[test]
    fn outstanding_exactly_at_threshold_meets_it() {
        let threshold = DunningCampaignThreshold {
            id: Uuid::new_v4(),
            dunning_campaign_id: Uuid::new_v4(),
            currency: Currency::Usd,
            amount_cents: 5_000,
        };
        let candidates = vec![invoice_with_total(5_000)];
        assert!(meets_threshold(&candidates, &threshold));
    }

    // =========================================================================
    // BXB-D02: outstanding one cent under the threshold does not meet it
    // =========================================================================
    #[test]
    fn outstanding_one_cent_under_threshold_does_not_meet_it() {
        let threshold = DunningCampaignThreshold {
            id: Uuid::new_v4(),
            dunning_campaign_id: Uuid::new_v4(),
            currency: Currency::Usd,
            amount_cents: 5_000,
        };
        let candidates = vec![invoice_with_total(4_999)];
        assert!(!meets_threshold(&candidates, &threshold));
    }
}

#[cfg(test)]
mod webhook_backoff_tests {
    use crate::webhooks::backoff_delay;
    use std::time::Duration;

    // =========================================================================
    // BXB-W01: retries far past the cap still clamp to 30 minutes
    // =========================================================================
    #[test]
    fn backoff_clamps_at_thirty_minutes_far_past_cap() {
        let base = Duration::from_secs(30);
        assert_eq!(backoff_delay(50, base), Duration::from_secs(30 * 60));
    }

    // =========================================================================
    // BXB-W02: the attempt just before the cap is reached still doubles
    // =========================================================================
    #[test]
    fn backoff_still_doubles_just_below_cap() {
        let base = Duration::from_secs(30);
        // 30 * 2^5 = 960s, below the 1800s cap
        assert_eq!(backoff_delay(5, base), Duration::from_secs(960));
    }
}

#[cfg(test)]
mod invoice_total_tests {
    use crate::model::{Invoice, InvoiceStatus, InvoiceType};
    use bxb_shared::Currency;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn draft_invoice() -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            subscription_id: None,
            invoice_number: None,
            status: InvoiceStatus::Draft,
            invoice_type: InvoiceType::Subscription,
            period_start: OffsetDateTime::now_utc(),
            period_end: OffsetDateTime::now_utc(),
            currency: Currency::Usd,
            subtotal_cents: 0,
            coupons_amount_cents: 0,
            prepaid_credit_amount_cents: 0,
            progressive_billing_credit_amount_cents: 0,
            tax_amount_cents: 0,
            total_cents: 0,
            line_items: None,
            due_date: None,
            issued_at: None,
            paid_at: None,
        }
    }

    // =========================================================================
    // BXB-I01: coupons + prepaid exactly consume the subtotal - total is
    // zero, not negative
    // =========================================================================
    #[test]
    fn deductions_exactly_matching_subtotal_clamp_to_zero() {
        let mut invoice = draft_invoice();
        invoice.subtotal_cents = 1_000;
        invoice.coupons_amount_cents = 400;
        invoice.prepaid_credit_amount_cents = 600;
        invoice.recompute_total();
        assert_eq!(invoice.total_cents, 0);
    }

    // =========================================================================
    // BXB-I02: deductions exceeding subtotal + tax still clamp to zero
    // rather than going negative
    // =========================================================================
    #[test]
    fn deductions_exceeding_subtotal_clamp_to_zero() {
        let mut invoice = draft_invoice();
        invoice.subtotal_cents = 1_000;
        invoice.tax_amount_cents = 100;
        invoice.coupons_amount_cents = 2_000;
        invoice.recompute_total();
        assert_eq!(invoice.total_cents, 0);
    }
}
