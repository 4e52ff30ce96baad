//! Scheduled task bodies, invoked by `crates/worker`'s cron
//! jobs. Each task acquires a lease keyed `(organization, task, period)`
//! before doing any work so a double-run (overlapping cron fire, worker
//! restart mid-task) cannot duplicate it, then drives the relevant
//! service (rating + invoicing, subscription lifecycle, dunning, webhook
//! delivery) end to end.
//!
//! Loading the handful of rows each task needs (subscriptions, plans,
//! customers, campaigns) is done with the same bare `sqlx::query_as`
//! style as `events.rs`/`aggregation.rs` rather than a separate
//! repository layer — there's no HTTP surface in this crate, so the
//! worker is the only caller of these loaders.

use crate::error::{CoreError, CoreResult};
use crate::events::BillingEventType;
use crate::model::{
    BillableMetric, BillingEntity, Charge, ChargeFilter, ChargeFilterValue, Commitment, Customer, DunningCampaign,
    DunningCampaignThreshold, Fee, Invoice, InvoiceType, PaymentRequest, Plan, Subscription, WebhookEndpoint,
};
use crate::dunning::{candidate_invoices, meets_threshold};
use crate::rating::{apply_commitment_correction, rate_charge, rate_charge_with_filters, RatingInput};
use crate::CoreService;
use bxb_shared::Currency;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct TaskLeases {
    pool: PgPool,
}

impl TaskLeases {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Attempts to claim the lease for this run. Returns `true` when this
    /// call is the owner and should perform the work, `false` when
    /// another run already holds (or has completed) this period's lease.
    pub async fn acquire(&self, organization_id: Uuid, task_name: &str, period: &str) -> CoreResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO task_leases (organization_id, task_name, period, acquired_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (organization_id, task_name, period) DO NOTHING
            RETURNING organization_id
            "#,
        )
        .bind(organization_id)
        .bind(task_name)
        .bind(period)
        .bind(OffsetDateTime::now_utc())
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }
}

async fn load_subscriptions_due_for_renewal(
    pool: &PgPool,
    organization_id: Uuid,
    now: OffsetDateTime,
) -> CoreResult<Vec<Subscription>> {
    let subscriptions = sqlx::query_as::<_, Subscription>(
        r#"
        SELECT id, organization_id, external_id, customer_id, plan_id, status, billing_time,
               trial_period_days, subscription_at, started_at, pay_in_advance, previous_plan_id,
               on_termination_action, paused_at, resumed_at, current_period_start, current_period_end
        FROM subscriptions
        WHERE organization_id = $1 AND status = 'active' AND current_period_end <= $2
        "#,
    )
    .bind(organization_id)
    .bind(now)
    .fetch_all(pool)
    .await?;

    Ok(subscriptions)
}

async fn load_trial_subscriptions(pool: &PgPool, organization_id: Uuid) -> CoreResult<Vec<Subscription>> {
    let subscriptions = sqlx::query_as::<_, Subscription>(
        r#"
        SELECT id, organization_id, external_id, customer_id, plan_id, status, billing_time,
               trial_period_days, subscription_at, started_at, pay_in_advance, previous_plan_id,
               on_termination_action, paused_at, resumed_at, current_period_start, current_period_end
        FROM subscriptions
        WHERE organization_id = $1 AND status = 'pending'
        "#,
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;

    Ok(subscriptions)
}

async fn load_customer(pool: &PgPool, customer_id: Uuid) -> CoreResult<Customer> {
    sqlx::query_as::<_, Customer>(
        "SELECT id, organization_id, external_id, currency, timezone, invoice_grace_period, net_payment_term, tax_exempt, created_at FROM customers WHERE id = $1",
    )
    .bind(customer_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::NotFound(format!("customer {customer_id}")))
}

/// Picks the organization's default billing entity: invoice numbering and
/// organization-level tax defaults are scoped to one even though the
/// model allows several per organization.
async fn load_default_billing_entity(pool: &PgPool, organization_id: Uuid) -> CoreResult<BillingEntity> {
    sqlx::query_as::<_, BillingEntity>(
        "SELECT id, organization_id, code, invoice_prefix, default_currency, invoice_sequence, applied_to_organization_tax_default FROM billing_entities WHERE organization_id = $1 ORDER BY id LIMIT 1",
    )
    .bind(organization_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::NotFound(format!("billing entity for organization {organization_id}")))
}

async fn load_plan(pool: &PgPool, plan_id: Uuid) -> CoreResult<Plan> {
    sqlx::query_as::<_, Plan>(
        "SELECT id, organization_id, code, interval, amount_cents, currency, trial_period_days FROM plans WHERE id = $1",
    )
    .bind(plan_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::NotFound(format!("plan {plan_id}")))
}

async fn load_charges(pool: &PgPool, plan_id: Uuid) -> CoreResult<Vec<Charge>> {
    let charges = sqlx::query_as::<_, Charge>(
        "SELECT id, plan_id, billable_metric_id, charge_model, properties FROM charges WHERE plan_id = $1",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;
    Ok(charges)
}

async fn load_metric(pool: &PgPool, billable_metric_id: Uuid) -> CoreResult<BillableMetric> {
    sqlx::query_as::<_, BillableMetric>(
        "SELECT id, organization_id, code, aggregation_type, field_name, recurring, rounding_function, rounding_precision, expression FROM billable_metrics WHERE id = $1",
    )
    .bind(billable_metric_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::NotFound(format!("billable metric {billable_metric_id}")))
}

async fn load_charge_filters(pool: &PgPool, charge_id: Uuid) -> CoreResult<Vec<ChargeFilter>> {
    let filters = sqlx::query_as::<_, ChargeFilter>(
        "SELECT id, charge_id, position FROM charge_filters WHERE charge_id = $1 ORDER BY position ASC",
    )
    .bind(charge_id)
    .fetch_all(pool)
    .await?;
    Ok(filters)
}

async fn load_charge_filter_values(pool: &PgPool, charge_id: Uuid) -> CoreResult<Vec<ChargeFilterValue>> {
    let values = sqlx::query_as::<_, ChargeFilterValue>(
        r#"
        SELECT cfv.id, cfv.charge_filter_id, cfv.billable_metric_filter_id, cfv.key, cfv.value
        FROM charge_filter_values cfv
        JOIN charge_filters cf ON cf.id = cfv.charge_filter_id
        WHERE cf.charge_id = $1
        "#,
    )
    .bind(charge_id)
    .fetch_all(pool)
    .await?;
    Ok(values)
}

async fn load_commitment(pool: &PgPool, plan_id: Uuid) -> CoreResult<Option<Commitment>> {
    let commitment = sqlx::query_as::<_, Commitment>(
        "SELECT id, plan_id, amount_cents, invoice_display_name FROM commitments WHERE plan_id = $1",
    )
    .bind(plan_id)
    .fetch_optional(pool)
    .await?;
    Ok(commitment)
}

async fn insert_invoice(pool: &PgPool, invoice: &Invoice) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO invoices (
            id, organization_id, customer_id, subscription_id, invoice_number, status, invoice_type,
            period_start, period_end, currency, subtotal_cents, coupons_amount_cents,
            prepaid_credit_amount_cents, progressive_billing_credit_amount_cents, tax_amount_cents,
            total_cents, line_items, due_date, issued_at, paid_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20)
        "#,
    )
    .bind(invoice.id)
    .bind(invoice.organization_id)
    .bind(invoice.customer_id)
    .bind(invoice.subscription_id)
    .bind(&invoice.invoice_number)
    .bind(invoice.status)
    .bind(invoice.invoice_type)
    .bind(invoice.period_start)
    .bind(invoice.period_end)
    .bind(invoice.currency)
    .bind(invoice.subtotal_cents)
    .bind(invoice.coupons_amount_cents)
    .bind(invoice.prepaid_credit_amount_cents)
    .bind(invoice.progressive_billing_credit_amount_cents)
    .bind(invoice.tax_amount_cents)
    .bind(invoice.total_cents)
    .bind(&invoice.line_items)
    .bind(invoice.due_date)
    .bind(invoice.issued_at)
    .bind(invoice.paid_at)
    .execute(pool)
    .await?;
    Ok(())
}

async fn insert_fee(pool: &PgPool, fee: &Fee) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO fees (
            id, invoice_id, fee_type, charge_id, subscription_id, customer_id, commitment_id,
            units, events_count, unit_amount_cents, amount_cents, taxes_amount_cents,
            total_amount_cents, payment_status, created_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
        "#,
    )
    .bind(fee.id)
    .bind(fee.invoice_id)
    .bind(fee.fee_type)
    .bind(fee.charge_id)
    .bind(fee.subscription_id)
    .bind(fee.customer_id)
    .bind(fee.commitment_id)
    .bind(fee.units)
    .bind(fee.events_count)
    .bind(fee.unit_amount_cents)
    .bind(fee.amount_cents)
    .bind(fee.taxes_amount_cents)
    .bind(fee.total_amount_cents)
    .bind(fee.payment_status)
    .bind(fee.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

async fn update_invoice_after_finalize(pool: &PgPool, invoice: &Invoice) -> CoreResult<()> {
    sqlx::query("UPDATE invoices SET status = $2, line_items = $3, issued_at = $4, due_date = $5 WHERE id = $1")
        .bind(invoice.id)
        .bind(invoice.status)
        .bind(&invoice.line_items)
        .bind(invoice.issued_at)
        .bind(invoice.due_date)
        .execute(pool)
        .await?;
    Ok(())
}

async fn advance_subscription_period(
    pool: &PgPool,
    subscription_id: Uuid,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
) -> CoreResult<()> {
    sqlx::query("UPDATE subscriptions SET current_period_start = $2, current_period_end = $3 WHERE id = $1")
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .execute(pool)
        .await?;
    Ok(())
}

async fn activate_subscription(pool: &PgPool, subscription_id: Uuid, now: OffsetDateTime) -> CoreResult<()> {
    sqlx::query(
        "UPDATE subscriptions SET status = 'active', started_at = COALESCE(started_at, $2) WHERE id = $1",
    )
    .bind(subscription_id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

async fn load_webhook_endpoints(pool: &PgPool, organization_id: Uuid) -> CoreResult<Vec<WebhookEndpoint>> {
    let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
        "SELECT id, organization_id, url, secret, status, max_retries FROM webhook_endpoints WHERE organization_id = $1",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;
    Ok(endpoints)
}

async fn load_webhook_endpoint(pool: &PgPool, endpoint_id: Uuid) -> CoreResult<WebhookEndpoint> {
    sqlx::query_as::<_, WebhookEndpoint>(
        "SELECT id, organization_id, url, secret, status, max_retries FROM webhook_endpoints WHERE id = $1",
    )
    .bind(endpoint_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::NotFound(format!("webhook endpoint {endpoint_id}")))
}

async fn load_dunning_campaign(pool: &PgPool, organization_id: Uuid) -> CoreResult<Option<DunningCampaign>> {
    let campaign = sqlx::query_as::<_, DunningCampaign>(
        "SELECT id, organization_id, code, max_attempts, days_between_attempts FROM dunning_campaigns WHERE organization_id = $1 ORDER BY id LIMIT 1",
    )
    .bind(organization_id)
    .fetch_optional(pool)
    .await?;
    Ok(campaign)
}

async fn load_dunning_threshold(
    pool: &PgPool,
    campaign_id: Uuid,
    currency: Currency,
) -> CoreResult<Option<DunningCampaignThreshold>> {
    let threshold = sqlx::query_as::<_, DunningCampaignThreshold>(
        "SELECT id, dunning_campaign_id, currency, amount_cents FROM dunning_campaign_thresholds WHERE dunning_campaign_id = $1 AND currency = $2",
    )
    .bind(campaign_id)
    .bind(currency)
    .fetch_optional(pool)
    .await?;
    Ok(threshold)
}

async fn load_customers(pool: &PgPool, organization_id: Uuid) -> CoreResult<Vec<Customer>> {
    let customers = sqlx::query_as::<_, Customer>(
        "SELECT id, organization_id, external_id, currency, timezone, invoice_grace_period, net_payment_term, tax_exempt, created_at FROM customers WHERE organization_id = $1",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;
    Ok(customers)
}

async fn load_finalized_invoices_for_customer(pool: &PgPool, customer_id: Uuid) -> CoreResult<Vec<Invoice>> {
    let invoices = sqlx::query_as::<_, Invoice>(
        r#"
        SELECT id, organization_id, customer_id, subscription_id, invoice_number, status, invoice_type,
               period_start, period_end, currency, subtotal_cents, coupons_amount_cents,
               prepaid_credit_amount_cents, progressive_billing_credit_amount_cents, tax_amount_cents,
               total_cents, line_items, due_date, issued_at, paid_at
        FROM invoices
        WHERE customer_id = $1 AND status = 'finalized'
        "#,
    )
    .bind(customer_id)
    .fetch_all(pool)
    .await?;
    Ok(invoices)
}

async fn load_non_failed_payment_requests(pool: &PgPool, customer_id: Uuid) -> CoreResult<Vec<PaymentRequest>> {
    let requests = sqlx::query_as::<_, PaymentRequest>(
        r#"
        SELECT id, organization_id, customer_id, currency, amount_cents, payment_attempts, payment_status, last_attempt_at, created_at
        FROM payment_requests
        WHERE customer_id = $1 AND payment_status != 'failed'
        "#,
    )
    .bind(customer_id)
    .fetch_all(pool)
    .await?;
    Ok(requests)
}

/// Rates every charge on `subscription`'s plan over
/// `[period_start, period_end)`, assembles and persists a draft invoice,
/// finalizes it, advances the subscription's period, and fans out an
/// `invoice.finalized` webhook.
///
/// Coupons, wallet draws and taxes are left empty here (assembling those
/// requires loading a customer's applied coupons/wallets/tax assignments,
/// which this worker-level pass doesn't do yet — `InvoiceAssembler`
/// itself handles them correctly once a caller supplies them).
async fn invoice_subscription_period(
    services: &CoreService,
    subscription: &Subscription,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> CoreResult<Invoice> {
    let pool = &services.runtime.pool;
    let customer = load_customer(pool, subscription.customer_id).await?;
    let billing_entity = load_default_billing_entity(pool, subscription.organization_id).await?;
    let plan = load_plan(pool, subscription.plan_id).await?;
    let charges = load_charges(pool, plan.id).await?;

    let invoice_id = Uuid::new_v4();
    let mut fees = Vec::with_capacity(charges.len());

    for charge in &charges {
        let metric = load_metric(pool, charge.billable_metric_id).await?;
        let filters = load_charge_filters(pool, charge.id).await?;
        let events = services
            .aggregation
            .load_events(subscription.organization_id, &customer.external_id, &metric.code, period_start, period_end)
            .await?;

        if filters.is_empty() {
            let carried = if metric.recurring {
                services.aggregation.load_carried_state(subscription.id, metric.id).await?
            } else {
                None
            };

            let (fee, carried_state) = rate_charge(RatingInput {
                invoice_id,
                subscription_id: subscription.id,
                customer_id: customer.id,
                charge,
                metric: &metric,
                filter_values: &[],
                events: &events,
                period_start,
                period_end,
                carried: carried.as_ref(),
            })?;

            if metric.recurring {
                services.aggregation.store_carried_state(subscription.id, metric.id, &carried_state).await?;
            }
            fees.push(fee);
        } else {
            let filter_values = load_charge_filter_values(pool, charge.id).await?;
            let filtered_fees = rate_charge_with_filters(
                invoice_id,
                subscription.id,
                customer.id,
                charge,
                &metric,
                &filters,
                &filter_values,
                &events,
                period_start,
                period_end,
            )?;
            fees.extend(filtered_fees);
        }
    }

    if let Some(commitment) = load_commitment(pool, plan.id).await? {
        if let Some(correction) = apply_commitment_correction(&fees, &commitment, invoice_id, subscription.id, customer.id) {
            fees.push(correction);
        }
    }

    let sequence = services.invoices.next_invoice_sequence(billing_entity.id).await?;
    let (mut invoice, _wallet_transactions, _coupons) = services.invoices.assemble_draft(
        subscription.organization_id,
        &customer,
        Some(subscription.id),
        InvoiceType::Subscription,
        period_start,
        period_end,
        fees.clone(),
        &[],
        &[],
        &[],
        &std::collections::HashMap::new(),
        &[],
        0,
        &billing_entity.invoice_prefix,
        sequence,
        now,
    );
    invoice.id = invoice_id;

    insert_invoice(pool, &invoice).await?;
    for fee in &fees {
        insert_fee(pool, fee).await?;
    }

    invoice = services.invoices.finalize(invoice, &fees)?;
    update_invoice_after_finalize(pool, &invoice).await?;
    advance_subscription_period(pool, subscription.id, period_end, period_end + (period_end - period_start)).await?;

    services.billing_events.emit(subscription.organization_id, BillingEventType::InvoiceFinalized, invoice.id);

    let endpoints = load_webhook_endpoints(pool, subscription.organization_id).await?;
    if !endpoints.is_empty() {
        let payload = serde_json::to_value(&invoice).unwrap_or(serde_json::Value::Null);
        services
            .webhooks
            .enqueue(subscription.organization_id, &endpoints, "invoice.finalized", "invoice", invoice.id, payload)
            .await?;
    }

    Ok(invoice)
}

/// `periodic_invoicing` — for each subscription whose current period just
/// ended, rates its plan's charges, finalizes the resulting invoice, and
/// advances the subscription into its next period.
pub async fn periodic_invoicing(services: &CoreService, organization_id: Uuid, period: &str) -> CoreResult<bool> {
    if !services.tasks.acquire(organization_id, "periodic_invoicing", period).await? {
        info!(organization_id = %organization_id, period, "periodic_invoicing already leased, skipping");
        return Ok(false);
    }

    let now = OffsetDateTime::now_utc();
    let subscriptions = load_subscriptions_due_for_renewal(&services.runtime.pool, organization_id, now).await?;

    for subscription in &subscriptions {
        let period_start = subscription.current_period_start;
        let period_end = subscription.current_period_end;
        match invoice_subscription_period(services, subscription, period_start, period_end, now).await {
            Ok(invoice) => {
                info!(subscription_id = %subscription.id, invoice_id = %invoice.id, "periodic_invoicing finalized invoice");
            }
            Err(e) => {
                error!(subscription_id = %subscription.id, error = %e, "periodic_invoicing failed for subscription");
            }
        }
    }

    Ok(true)
}

/// `trial_expiry` — flips subscriptions past trial into active billing,
/// generating the initial invoice when `pay_in_advance`.
pub async fn trial_expiry(services: &CoreService, organization_id: Uuid, period: &str) -> CoreResult<bool> {
    if !services.tasks.acquire(organization_id, "trial_expiry", period).await? {
        return Ok(false);
    }

    let now = OffsetDateTime::now_utc();
    let pending = load_trial_subscriptions(&services.runtime.pool, organization_id).await?;

    for subscription in &pending {
        if subscription.in_trial(now) {
            continue;
        }

        activate_subscription(&services.runtime.pool, subscription.id, now).await?;
        services
            .billing_events
            .emit(organization_id, BillingEventType::SubscriptionActivated, subscription.id);
        info!(subscription_id = %subscription.id, "trial_expiry activated subscription");

        if subscription.pay_in_advance {
            match invoice_subscription_period(
                services,
                subscription,
                subscription.current_period_start,
                subscription.current_period_end,
                now,
            )
            .await
            {
                Ok(invoice) => info!(subscription_id = %subscription.id, invoice_id = %invoice.id, "trial_expiry issued pay-in-advance invoice"),
                Err(e) => error!(subscription_id = %subscription.id, error = %e, "trial_expiry invoicing failed"),
            }
        }
    }

    Ok(true)
}

/// `dunning_tick` — scans each customer's past-due finalized invoices,
/// and opens a `PaymentRequest` once the organization's dunning campaign
/// threshold is met.
pub async fn dunning_tick(services: &CoreService, organization_id: Uuid, period: &str) -> CoreResult<bool> {
    if !services.tasks.acquire(organization_id, "dunning_tick", period).await? {
        return Ok(false);
    }

    let Some(campaign) = load_dunning_campaign(&services.runtime.pool, organization_id).await? else {
        info!(organization_id = %organization_id, "dunning_tick: no campaign configured, skipping");
        return Ok(true);
    };

    let now = OffsetDateTime::now_utc();
    let customers = load_customers(&services.runtime.pool, organization_id).await?;

    for customer in &customers {
        let invoices = load_finalized_invoices_for_customer(&services.runtime.pool, customer.id).await?;
        let candidates = candidate_invoices(&invoices, customer.id, customer.currency, now);
        if candidates.is_empty() {
            continue;
        }

        let Some(threshold) = load_dunning_threshold(&services.runtime.pool, campaign.id, customer.currency).await? else {
            continue;
        };
        if !meets_threshold(&candidates, &threshold) {
            continue;
        }

        let existing = load_non_failed_payment_requests(&services.runtime.pool, customer.id).await?;
        let created = services
            .dunning
            .create_payment_request(organization_id, customer.id, customer.currency, &candidates, &existing)
            .await?;

        if let Some(pr) = created {
            services.billing_events.emit(organization_id, BillingEventType::PaymentRequestCreated, pr.id);
            info!(customer_id = %customer.id, payment_request_id = %pr.id, "dunning_tick opened payment request");
        }
    }

    Ok(true)
}

/// `webhook_retry` — scans failed-eligible webhooks and redelivers them.
pub async fn webhook_retry(services: &CoreService, organization_id: Uuid, period: &str) -> CoreResult<bool> {
    if !services.tasks.acquire(organization_id, "webhook_retry", period).await? {
        return Ok(false);
    }

    let now = OffsetDateTime::now_utc();
    let due = services.webhooks.due_for_retry(organization_id, now).await?;

    for mut webhook in due {
        let endpoint = match load_webhook_endpoint(&services.runtime.pool, webhook.endpoint_id).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(webhook_id = %webhook.id, error = %e, "webhook_retry: endpoint missing, skipping");
                continue;
            }
        };

        match services.webhooks.deliver(&mut webhook, &endpoint).await {
            Ok(attempt) if attempt.succeeded => {
                services.billing_events.emit(organization_id, BillingEventType::WebhookDelivered, webhook.id);
            }
            Ok(_) => {
                services.billing_events.emit(organization_id, BillingEventType::WebhookFailed, webhook.id);
            }
            Err(e) => {
                error!(webhook_id = %webhook.id, error = %e, "webhook_retry: delivery attempt errored");
            }
        }
    }

    Ok(true)
}

