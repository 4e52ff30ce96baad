//! Invoice assembler: `generate_invoice`/`generate_one_off`,
//! plus the draft -> finalized -> paid/voided state machine.
//!
//! The 8-step algorithm is split into small pure helper functions
//! (`apply_coupons`, `draw_wallets`, `compute_taxes`) operating on plain
//! `Fee`/`Invoice` values, then one orchestrating async method that owns
//! the transaction boundary.

use crate::error::{CoreError, CoreResult};
use crate::model::{
    AppliedCoupon, AppliedCouponStatus, AppliedTax, Coupon, CouponType, Customer, Fee, Invoice,
    InvoiceStatus, InvoiceType, Tax, Taxable, Wallet, WalletTransaction, WalletTransactionSource,
    WalletTransactionStatus, WalletTransactionType,
};
use rust_decimal::prelude::*;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

fn round_cents(amount: Decimal) -> i64 {
    amount.round_dp(0).to_i64().unwrap_or(0)
}

/// Step 3: applies coupons in `AppliedCoupon` creation order, mutating
/// each coupon's remaining-uses counter and returning the total discount
/// in cents plus the coupons now exhausted.
pub fn apply_coupons(
    subtotal_cents: i64,
    applied_coupons: &[(AppliedCoupon, Coupon)],
) -> (i64, Vec<AppliedCoupon>) {
    let mut remaining = subtotal_cents;
    let mut total_discount = 0i64;
    let mut updated = Vec::with_capacity(applied_coupons.len());

    for (applied, coupon) in applied_coupons {
        if applied.status != AppliedCouponStatus::Active || remaining <= 0 {
            updated.push(applied.clone());
            continue;
        }

        let discount = match coupon.coupon_type {
            CouponType::FixedAmount => coupon.amount_cents.unwrap_or(0).min(remaining),
            CouponType::Percentage => {
                let rate = coupon.percentage_rate.unwrap_or(Decimal::ZERO);
                round_cents(Decimal::from(remaining) * rate / Decimal::from(100))
            }
        };

        total_discount += discount;
        remaining -= discount;

        let mut next = applied.clone();
        next.decrement_after_use(coupon);
        updated.push(next);
    }

    (total_discount, updated)
}

pub struct WalletDraw {
    pub wallet_id: Uuid,
    pub credit_amount: Decimal,
    pub currency_amount_cents: i64,
}

/// Step 4: enumerate active wallets ascending `priority` then descending
/// `credits_balance`, drawing up to `remaining` cents. Returns the draws
/// and the total cents covered.
pub fn draw_wallets(remaining_cents: i64, wallets: &[Wallet], now: OffsetDateTime) -> (Vec<WalletDraw>, i64) {
    let mut candidates: Vec<&Wallet> = wallets.iter().filter(|w| w.is_drawable(now)).collect();
    candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.credits_balance.cmp(&a.credits_balance)));

    let mut remaining = remaining_cents;
    let mut draws = Vec::new();
    let mut total_drawn = 0i64;

    for wallet in candidates {
        if remaining <= 0 {
            break;
        }
        if wallet.rate_amount.is_zero() {
            continue;
        }

        let wallet_cents = round_cents(wallet.credits_balance * wallet.rate_amount * Decimal::from(100));
        let draw_cents = remaining.min(wallet_cents);
        if draw_cents <= 0 {
            continue;
        }

        let credit_amount = Decimal::from(draw_cents) / Decimal::from(100) / wallet.rate_amount;

        draws.push(WalletDraw {
            wallet_id: wallet.id,
            credit_amount,
            currency_amount_cents: draw_cents,
        });
        remaining -= draw_cents;
        total_drawn += draw_cents;
    }

    (draws, total_drawn)
}

/// Step 6: taxes accumulate per fee from fee-specific `AppliedTax`, falling
/// back to customer defaults then organization defaults
/// (`applied_to_organization = true`), rounded once per fee.
pub fn compute_taxes(
    fees: &[Fee],
    applied_taxes: &[AppliedTax],
    taxes_by_id: &std::collections::HashMap<Uuid, Tax>,
    organization_default_tax_ids: &[Uuid],
) -> i64 {
    let mut total_tax_cents = 0i64;

    for fee in fees {
        let fee_specific: Vec<&Tax> = applied_taxes
            .iter()
            .filter(|at| matches!(at.taxable(), Some(Taxable::Fee(id)) if id == fee.id))
            .filter_map(|at| taxes_by_id.get(&at.tax_id))
            .collect();

        let applicable: Vec<&Tax> = if !fee_specific.is_empty() {
            fee_specific
        } else {
            organization_default_tax_ids
                .iter()
                .filter_map(|id| taxes_by_id.get(id))
                .filter(|t| t.applied_to_organization)
                .collect()
        };

        let rate_sum: Decimal = applicable.iter().map(|t| t.rate_percent).sum();
        let fee_tax = round_cents(Decimal::from(fee.amount_cents) * rate_sum / Decimal::from(100));
        total_tax_cents += fee_tax;
    }

    total_tax_cents
}

/// Pure arithmetic core of invoice assembly: rates already-computed fees
/// through coupons, taxes, and a wallet draw capped so it never exceeds
/// what the invoice ends up owing, into a draft `Invoice`.
#[allow(clippy::too_many_arguments)]
fn assemble_invoice(
    organization_id: Uuid,
    customer: &Customer,
    subscription_id: Option<Uuid>,
    invoice_type: InvoiceType,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    fees: Vec<Fee>,
    applied_coupons: &[(AppliedCoupon, Coupon)],
    wallets: &[Wallet],
    applied_taxes: &[AppliedTax],
    taxes_by_id: &std::collections::HashMap<Uuid, Tax>,
    organization_default_tax_ids: &[Uuid],
    progressive_billing_credit_cents: i64,
    invoice_prefix: &str,
    sequence: i64,
    now: OffsetDateTime,
) -> (Invoice, Vec<WalletTransaction>, Vec<AppliedCoupon>) {
    let subtotal_cents: i64 = fees.iter().map(|f| f.amount_cents).sum();

    let (coupons_amount_cents, updated_coupons) = apply_coupons(subtotal_cents, applied_coupons);

    let tax_amount_cents = compute_taxes(&fees, applied_taxes, taxes_by_id, organization_default_tax_ids);

    let after_coupons = (subtotal_cents - coupons_amount_cents).max(0);
    // What's left to collect once coupons, progressive credit and tax are
    // accounted for is the ceiling a wallet draw must never exceed —
    // otherwise `Invoice::recompute_total` clamps the surplus away while
    // the wallet ledger still shows it drawn.
    let wallet_draw_ceiling = (after_coupons - progressive_billing_credit_cents + tax_amount_cents).max(0);
    let (draws, prepaid_credit_amount_cents) = draw_wallets(wallet_draw_ceiling, wallets, now);

    let mut invoice = Invoice {
        id: Uuid::new_v4(),
        organization_id,
        customer_id: customer.id,
        subscription_id,
        invoice_number: Some(format!("{invoice_prefix}-{sequence}")),
        status: InvoiceStatus::Draft,
        invoice_type,
        period_start,
        period_end,
        currency: customer.currency,
        subtotal_cents,
        coupons_amount_cents,
        prepaid_credit_amount_cents,
        progressive_billing_credit_amount_cents: progressive_billing_credit_cents,
        tax_amount_cents,
        total_cents: 0,
        line_items: None,
        due_date: Some(now + time::Duration::days(customer.net_payment_term as i64) + time::Duration::days(customer.invoice_grace_period as i64)),
        issued_at: Some(now + time::Duration::days(customer.invoice_grace_period as i64)),
        paid_at: None,
    };
    invoice.recompute_total();

    let wallet_transactions = draws
        .iter()
        .map(|draw| WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: draw.wallet_id,
            transaction_type: WalletTransactionType::Outbound,
            status: crate::model::SettlementStatus::Pending,
            transaction_status: WalletTransactionStatus::Invoiced,
            source: WalletTransactionSource::Manual,
            amount: Decimal::from(draw.currency_amount_cents) / Decimal::from(100),
            credit_amount: draw.credit_amount,
            invoice_id: Some(invoice.id),
            created_at: now,
        })
        .collect();

    info!(
        invoice_id = %invoice.id,
        subtotal_cents,
        coupons_amount_cents,
        prepaid_credit_amount_cents,
        tax_amount_cents,
        total_cents = invoice.total_cents,
        "assembled invoice draft"
    );

    (invoice, wallet_transactions, updated_coupons)
}

pub struct InvoiceAssembler {
    pool: PgPool,
}

impl InvoiceAssembler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Rates, discounts, draws and taxes an invoice's fees end to end. The database
    /// transaction around inserting the invoice/fee/transaction rows is
    /// the caller's responsibility once wired to a real pool; this method
    /// performs the arithmetic and returns the fully assembled draft.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble_draft(
        &self,
        organization_id: Uuid,
        customer: &Customer,
        subscription_id: Option<Uuid>,
        invoice_type: InvoiceType,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        fees: Vec<Fee>,
        applied_coupons: &[(AppliedCoupon, Coupon)],
        wallets: &[Wallet],
        applied_taxes: &[AppliedTax],
        taxes_by_id: &std::collections::HashMap<Uuid, Tax>,
        organization_default_tax_ids: &[Uuid],
        progressive_billing_credit_cents: i64,
        invoice_prefix: &str,
        sequence: i64,
        now: OffsetDateTime,
    ) -> (Invoice, Vec<WalletTransaction>, Vec<AppliedCoupon>) {
        assemble_invoice(
            organization_id,
            customer,
            subscription_id,
            invoice_type,
            period_start,
            period_end,
            fees,
            applied_coupons,
            wallets,
            applied_taxes,
            taxes_by_id,
            organization_default_tax_ids,
            progressive_billing_credit_cents,
            invoice_prefix,
            sequence,
            now,
        )
    }

    /// Draft -> finalized: snapshots line items, locks fees, settles
    /// pending outbound wallet transactions, returns the finalized invoice
    /// for the caller to persist and emit `invoice.finalized` from.
    pub fn finalize(&self, mut invoice: Invoice, fees: &[Fee]) -> CoreResult<Invoice> {
        if invoice.status != InvoiceStatus::Draft {
            return Err(CoreError::InvalidState(format!(
                "invoice {} is not draft",
                invoice.id
            )));
        }

        let line_items = serde_json::to_value(fees).map_err(|e| CoreError::Validation(e.to_string()))?;
        invoice.line_items = Some(line_items);
        invoice.status = InvoiceStatus::Finalized;
        Ok(invoice)
    }

    /// Finalized -> paid, requires settlements to cover the full total.
    pub fn mark_paid(&self, mut invoice: Invoice, settled_cents: i64, now: OffsetDateTime) -> CoreResult<Invoice> {
        if invoice.status != InvoiceStatus::Finalized {
            return Err(CoreError::InvalidState(format!(
                "invoice {} is not finalized",
                invoice.id
            )));
        }
        if settled_cents < invoice.total_cents {
            return Err(CoreError::InvalidState(format!(
                "invoice {} settlements {} cents short of total {} cents",
                invoice.id, settled_cents, invoice.total_cents
            )));
        }

        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(now);
        Ok(invoice)
    }

    /// Draft -> voided, or finalized -> voided when no non-failed
    /// settlement exists yet.
    pub fn void(&self, mut invoice: Invoice, has_non_failed_settlement: bool) -> CoreResult<Invoice> {
        match invoice.status {
            InvoiceStatus::Draft => {}
            InvoiceStatus::Finalized if !has_non_failed_settlement => {}
            _ => {
                return Err(CoreError::InvalidState(format!(
                    "invoice {} cannot be voided from status {:?}",
                    invoice.id, invoice.status
                )));
            }
        }

        invoice.status = InvoiceStatus::Voided;
        warn!(invoice_id = %invoice.id, "invoice voided");
        Ok(invoice)
    }

    pub async fn next_invoice_sequence(&self, billing_entity_id: Uuid) -> CoreResult<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            UPDATE billing_entities
            SET invoice_sequence = invoice_sequence + 1
            WHERE id = $1
            RETURNING invoice_sequence
            "#,
        )
        .bind(billing_entity_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeeType, PaymentStatus, WalletStatus};
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    fn sample_coupon(coupon_type: CouponType, amount_cents: Option<i64>, percentage_rate: Option<Decimal>) -> Coupon {
        Coupon {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            code: "WELCOME".into(),
            coupon_type,
            amount_cents,
            percentage_rate,
            frequency: crate::model::CouponFrequency::Once,
            frequency_duration: None,
            reusable: false,
            expiration_at: None,
        }
    }

    fn sample_applied(status: AppliedCouponStatus) -> AppliedCoupon {
        AppliedCoupon {
            id: Uuid::new_v4(),
            coupon_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            status,
            frequency_duration_remaining: None,
            created_at: datetime!(2026-01-01 00:00:00 UTC),
        }
    }

    #[test]
    fn fixed_amount_coupon_clamps_to_remaining() {
        let coupon = sample_coupon(CouponType::FixedAmount, Some(5_000), None);
        let applied = sample_applied(AppliedCouponStatus::Active);
        let (discount, updated) = apply_coupons(3_000, &[(applied, coupon)]);
        assert_eq!(discount, 3_000);
        assert_eq!(updated[0].status, AppliedCouponStatus::Terminated);
    }

    #[test]
    fn percentage_coupon_computes_rate() {
        let coupon = sample_coupon(CouponType::Percentage, None, Some(dec!(10)));
        let applied = sample_applied(AppliedCouponStatus::Active);
        let (discount, _) = apply_coupons(10_000, &[(applied, coupon)]);
        assert_eq!(discount, 1_000);
    }

    #[test]
    fn terminated_coupon_is_skipped() {
        let coupon = sample_coupon(CouponType::FixedAmount, Some(5_000), None);
        let applied = sample_applied(AppliedCouponStatus::Terminated);
        let (discount, _) = apply_coupons(10_000, &[(applied, coupon)]);
        assert_eq!(discount, 0);
    }

    fn sample_wallet(priority: i32, credits_balance: Decimal) -> Wallet {
        Wallet {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            code: "main".into(),
            credits_balance,
            rate_amount: dec!(1),
            currency: bxb_shared::Currency::Usd,
            priority,
            expiration_at: None,
            status: WalletStatus::Active,
        }
    }

    #[test]
    fn wallet_draw_order_is_priority_then_balance() {
        let wallets = vec![sample_wallet(2, dec!(100)), sample_wallet(1, dec!(50))];
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let (draws, total) = draw_wallets(6_000, &wallets, now);
        assert_eq!(draws[0].wallet_id, wallets[1].id);
        assert_eq!(total, 6_000);
    }

    #[test]
    fn expired_wallet_is_skipped() {
        let mut wallet = sample_wallet(1, dec!(100));
        wallet.expiration_at = Some(datetime!(2025-01-01 00:00:00 UTC));
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let (draws, total) = draw_wallets(1_000, &[wallet], now);
        assert!(draws.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn tax_falls_back_to_organization_default() {
        let org_tax = Tax {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            code: "VAT".into(),
            rate_percent: dec!(20),
            applied_to_organization: true,
        };
        let mut taxes_by_id = std::collections::HashMap::new();
        taxes_by_id.insert(org_tax.id, org_tax.clone());

        let fee = Fee {
            id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            fee_type: FeeType::Charge,
            charge_id: None,
            subscription_id: None,
            customer_id: Uuid::new_v4(),
            commitment_id: None,
            units: Decimal::ONE,
            events_count: 1,
            unit_amount_cents: 10_000,
            amount_cents: 10_000,
            taxes_amount_cents: 0,
            total_amount_cents: 10_000,
            payment_status: PaymentStatus::Pending,
            created_at: datetime!(2026-01-01 00:00:00 UTC),
        };

        let tax_cents = compute_taxes(&[fee], &[], &taxes_by_id, &[org_tax.id]);
        assert_eq!(tax_cents, 2_000);
    }

    fn sample_customer() -> Customer {
        Customer {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            external_id: "cust_1".into(),
            currency: bxb_shared::Currency::Usd,
            timezone: "UTC".into(),
            invoice_grace_period: 0,
            net_payment_term: 30,
            tax_exempt: false,
            created_at: datetime!(2026-01-01 00:00:00 UTC),
        }
    }

    fn sample_fee(amount_cents: i64) -> Fee {
        Fee {
            id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            fee_type: FeeType::Charge,
            charge_id: None,
            subscription_id: None,
            customer_id: Uuid::new_v4(),
            commitment_id: None,
            units: Decimal::ONE,
            events_count: 1,
            unit_amount_cents: amount_cents,
            amount_cents,
            taxes_amount_cents: 0,
            total_amount_cents: amount_cents,
            payment_status: PaymentStatus::Pending,
            created_at: datetime!(2026-01-01 00:00:00 UTC),
        }
    }

    /// A wallet with more than enough balance to cover the whole subtotal,
    /// combined with a progressive-billing credit that alone covers most of
    /// it, must not be drawn past what `total_cents` actually needs —
    /// otherwise the ledger debits credits an invoice never billed for.
    #[test]
    fn wallet_draw_is_capped_by_progressive_credit() {
        let customer = sample_customer();
        let fees = vec![sample_fee(10_000)];
        let wallets = vec![sample_wallet(1, dec!(1000))];
        let now = datetime!(2026-01-01 00:00:00 UTC);

        let (invoice, wallet_transactions, _) = assemble_invoice(
            customer.organization_id,
            &customer,
            None,
            InvoiceType::Subscription,
            now,
            now,
            fees,
            &[],
            &wallets,
            &[],
            &std::collections::HashMap::new(),
            &[],
            9_000,
            "INV",
            1,
            now,
        );

        assert_eq!(invoice.total_cents, 0);
        assert_eq!(invoice.prepaid_credit_amount_cents, 1_000);
        assert_eq!(wallet_transactions[0].amount, dec!(10));
    }
}
