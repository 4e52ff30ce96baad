//! Invariant checker: runnable consistency checks over the
//! billing data — invoice totals, fee sums, wallet balances, and
//! duplicate payment requests.
//!
//! Checks only read; they never mutate, so they are safe to run after any
//! mutation or as a standalone health job.

use crate::error::CoreResult;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub org_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceTotalMismatchRow {
    id: Uuid,
    organization_id: Uuid,
    subtotal_cents: i64,
    coupons_amount_cents: i64,
    prepaid_credit_amount_cents: i64,
    progressive_billing_credit_amount_cents: i64,
    tax_amount_cents: i64,
    total_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct FeeSumMismatchRow {
    invoice_id: Uuid,
    organization_id: Uuid,
    subtotal_cents: i64,
    fee_sum_cents: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeWalletRow {
    id: Uuid,
    organization_id: Uuid,
    credits_balance: rust_decimal::Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicatePendingPrRow {
    customer_id: Uuid,
    organization_id: Uuid,
    pr_count: i64,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> CoreResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        let mut checks_run = 0usize;

        for name in Self::available_checks() {
            checks_run += 1;
            violations.extend(self.run_check(name).await?);
        }

        let checks_failed = violations.len().min(checks_run);
        Ok(InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    pub async fn run_check(&self, name: &str) -> CoreResult<Vec<InvariantViolation>> {
        match name {
            "invoice_total_reconciles" => self.check_invoice_total_reconciles().await,
            "invoice_subtotal_matches_fees" => self.check_invoice_subtotal_matches_fees().await,
            "wallet_balance_non_negative" => self.check_wallet_balance_non_negative().await,
            "no_duplicate_pending_payment_requests" => self.check_no_duplicate_pending_payment_requests().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "invoice_total_reconciles",
            "invoice_subtotal_matches_fees",
            "wallet_balance_non_negative",
            "no_duplicate_pending_payment_requests",
        ]
    }

    /// `total = subtotal - coupons - prepaid - progressive + tax`, `total >= 0`.
    async fn check_invoice_total_reconciles(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows = sqlx::query_as::<_, InvoiceTotalMismatchRow>(
            r#"
            SELECT id, organization_id, subtotal_cents, coupons_amount_cents,
                   prepaid_credit_amount_cents, progressive_billing_credit_amount_cents,
                   tax_amount_cents, total_cents
            FROM invoices
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut violations = Vec::new();
        for row in rows {
            let expected = (row.subtotal_cents
                - row.coupons_amount_cents
                - row.prepaid_credit_amount_cents
                - row.progressive_billing_credit_amount_cents
                + row.tax_amount_cents)
                .max(0);

            if expected != row.total_cents || row.total_cents < 0 {
                violations.push(InvariantViolation {
                    invariant: "invoice_total_reconciles".into(),
                    org_ids: vec![row.organization_id],
                    description: format!("invoice {} total_cents={} expected={}", row.id, row.total_cents, expected),
                    context: serde_json::json!({ "invoice_id": row.id }),
                    severity: ViolationSeverity::Critical,
                });
            }
        }
        Ok(violations)
    }

    /// `Σ fees.amount_cents = invoice.subtotal_cents`.
    async fn check_invoice_subtotal_matches_fees(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows = sqlx::query_as::<_, FeeSumMismatchRow>(
            r#"
            SELECT i.id AS invoice_id, i.organization_id, i.subtotal_cents,
                   SUM(f.amount_cents) AS fee_sum_cents
            FROM invoices i
            LEFT JOIN fees f ON f.invoice_id = i.id
            GROUP BY i.id, i.organization_id, i.subtotal_cents
            HAVING i.subtotal_cents != COALESCE(SUM(f.amount_cents), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_subtotal_matches_fees".into(),
                org_ids: vec![row.organization_id],
                description: format!(
                    "invoice {} subtotal_cents={} fee_sum_cents={:?}",
                    row.invoice_id, row.subtotal_cents, row.fee_sum_cents
                ),
                context: serde_json::json!({ "invoice_id": row.invoice_id }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Wallet balance never negative.
    async fn check_wallet_balance_non_negative(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows = sqlx::query_as::<_, NegativeWalletRow>(
            "SELECT id, organization_id, credits_balance FROM wallets WHERE credits_balance < 0",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "wallet_balance_non_negative".into(),
                org_ids: vec![row.organization_id],
                description: format!("wallet {} credits_balance={}", row.id, row.credits_balance),
                context: serde_json::json!({ "wallet_id": row.id }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Dunning does not create a second PR while one is pending.
    async fn check_no_duplicate_pending_payment_requests(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows = sqlx::query_as::<_, DuplicatePendingPrRow>(
            r#"
            SELECT customer_id, organization_id, COUNT(*) AS pr_count
            FROM payment_requests
            WHERE payment_status = 'pending'
            GROUP BY customer_id, organization_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_duplicate_pending_payment_requests".into(),
                org_ids: vec![row.organization_id],
                description: format!("customer {} has {} pending payment requests", row.customer_id, row.pr_count),
                context: serde_json::json!({ "customer_id": row.customer_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}
