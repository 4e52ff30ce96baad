//! Wallet ledger: `create_wallet`, `top_up`, `debit`,
//! `terminate`. Every mutation appends a `WalletTransaction` then updates
//! the cached balance in the same statement.

use crate::error::{CoreError, CoreResult};
use crate::model::{
    SettlementStatus, Wallet, WalletStatus, WalletTransaction, WalletTransactionSource,
    WalletTransactionStatus, WalletTransactionType,
};
use bxb_shared::Currency;
use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

pub struct WalletLedger {
    pool: PgPool,
}

impl WalletLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_wallet(
        &self,
        organization_id: Uuid,
        customer_id: Uuid,
        code: &str,
        currency: Currency,
        rate_amount: Decimal,
        priority: i32,
        initial_credits: Decimal,
    ) -> CoreResult<(Wallet, Option<WalletTransaction>)> {
        if rate_amount <= Decimal::ZERO {
            return Err(CoreError::Validation("rate_amount must be positive".into()));
        }

        let wallet = Wallet {
            id: Uuid::new_v4(),
            organization_id,
            customer_id,
            code: code.to_string(),
            credits_balance: Decimal::ZERO,
            rate_amount,
            currency,
            priority,
            expiration_at: None,
            status: WalletStatus::Active,
        };

        sqlx::query(
            r#"
            INSERT INTO wallets (id, organization_id, customer_id, code, credits_balance, rate_amount, currency, priority, expiration_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(wallet.id)
        .bind(wallet.organization_id)
        .bind(wallet.customer_id)
        .bind(&wallet.code)
        .bind(wallet.credits_balance)
        .bind(wallet.rate_amount)
        .bind(wallet.currency)
        .bind(wallet.priority)
        .bind(wallet.expiration_at)
        .bind(wallet.status)
        .execute(&self.pool)
        .await?;

        if initial_credits.is_zero() {
            return Ok((wallet, None));
        }

        let (wallet, txn) = self
            .top_up(&wallet, initial_credits, WalletTransactionSource::Manual, WalletTransactionStatus::Granted)
            .await?;
        Ok((wallet, Some(txn)))
    }

    /// Inbound mutation: grant or purchase credits. Appends the
    /// transaction then bumps `credits_balance`.
    pub async fn top_up(
        &self,
        wallet: &Wallet,
        credits: Decimal,
        source: WalletTransactionSource,
        transaction_status: WalletTransactionStatus,
    ) -> CoreResult<(Wallet, WalletTransaction)> {
        if wallet.status != WalletStatus::Active {
            return Err(CoreError::InvalidState(format!("wallet {} is not active", wallet.id)));
        }
        if credits <= Decimal::ZERO {
            return Err(CoreError::Validation("top_up credits must be positive".into()));
        }

        let txn = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            transaction_type: WalletTransactionType::Inbound,
            status: SettlementStatus::Settled,
            transaction_status,
            source,
            amount: credits * wallet.rate_amount,
            credit_amount: credits,
            invoice_id: None,
            created_at: OffsetDateTime::now_utc(),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO wallet_transactions (id, wallet_id, transaction_type, status, transaction_status, source, amount, credit_amount, invoice_id, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)")
            .bind(txn.id)
            .bind(txn.wallet_id)
            .bind(txn.transaction_type)
            .bind(txn.status)
            .bind(txn.transaction_status)
            .bind(txn.source)
            .bind(txn.amount)
            .bind(txn.credit_amount)
            .bind(txn.invoice_id)
            .bind(txn.created_at)
            .execute(&mut *tx)
            .await?;

        let updated: Wallet = sqlx::query_as(
            "UPDATE wallets SET credits_balance = credits_balance + $2 WHERE id = $1 RETURNING id, organization_id, customer_id, code, credits_balance, rate_amount, currency, priority, expiration_at, status",
        )
        .bind(wallet.id)
        .bind(credits)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(wallet_id = %wallet.id, %credits, "wallet topped up");
        Ok((updated, txn))
    }

    /// Outbound mutation tied to an invoice, created pending until the
    /// invoice finalizes. Requires the wallet to be drawable
    /// and the invoice currency to match.
    pub async fn debit(
        &self,
        wallet: &Wallet,
        credit_amount: Decimal,
        invoice_id: Uuid,
        invoice_currency: Currency,
    ) -> CoreResult<(Wallet, WalletTransaction)> {
        let now = OffsetDateTime::now_utc();
        if !wallet.is_drawable(now) {
            return Err(CoreError::InvalidState(format!("wallet {} is not drawable", wallet.id)));
        }
        if wallet.currency != invoice_currency {
            return Err(CoreError::Validation(format!(
                "wallet currency {:?} does not match invoice currency {:?}",
                wallet.currency, invoice_currency
            )));
        }
        if credit_amount > wallet.credits_balance {
            return Err(CoreError::Validation("debit exceeds wallet balance".into()));
        }

        let txn = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            transaction_type: WalletTransactionType::Outbound,
            status: SettlementStatus::Pending,
            transaction_status: WalletTransactionStatus::Invoiced,
            source: WalletTransactionSource::Manual,
            amount: credit_amount * wallet.rate_amount,
            credit_amount,
            invoice_id: Some(invoice_id),
            created_at: now,
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO wallet_transactions (id, wallet_id, transaction_type, status, transaction_status, source, amount, credit_amount, invoice_id, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)")
            .bind(txn.id)
            .bind(txn.wallet_id)
            .bind(txn.transaction_type)
            .bind(txn.status)
            .bind(txn.transaction_status)
            .bind(txn.source)
            .bind(txn.amount)
            .bind(txn.credit_amount)
            .bind(txn.invoice_id)
            .bind(txn.created_at)
            .execute(&mut *tx)
            .await?;

        // Locked-for-update row: "acceptable only when the
        // selected row is locked-for-update for the duration of the debit".
        let updated: Wallet = sqlx::query_as(
            "UPDATE wallets SET credits_balance = credits_balance - $2 WHERE id = $1 AND credits_balance >= $2 RETURNING id, organization_id, customer_id, code, credits_balance, rate_amount, currency, priority, expiration_at, status",
        )
        .bind(wallet.id)
        .bind(credit_amount)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((updated, txn))
    }

    /// Settles a pending outbound transaction when its invoice finalizes.
    pub async fn settle(&self, transaction_id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE wallet_transactions SET status = $2 WHERE id = $1")
            .bind(transaction_id)
            .bind(SettlementStatus::Settled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reverses a pending outbound transaction with a compensating inbound
    /// one when its invoice is voided.
    pub async fn reverse(&self, outbound: &WalletTransaction) -> CoreResult<WalletTransaction> {
        if outbound.transaction_type != WalletTransactionType::Outbound {
            return Err(CoreError::Validation("reverse requires an outbound transaction".into()));
        }

        let compensating = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: outbound.wallet_id,
            transaction_type: WalletTransactionType::Inbound,
            status: SettlementStatus::Settled,
            transaction_status: WalletTransactionStatus::Voided,
            source: outbound.source,
            amount: outbound.amount,
            credit_amount: outbound.credit_amount,
            invoice_id: outbound.invoice_id,
            created_at: OffsetDateTime::now_utc(),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE wallet_transactions SET status = $2 WHERE id = $1")
            .bind(outbound.id)
            .bind(SettlementStatus::Failed)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO wallet_transactions (id, wallet_id, transaction_type, status, transaction_status, source, amount, credit_amount, invoice_id, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)")
            .bind(compensating.id)
            .bind(compensating.wallet_id)
            .bind(compensating.transaction_type)
            .bind(compensating.status)
            .bind(compensating.transaction_status)
            .bind(compensating.source)
            .bind(compensating.amount)
            .bind(compensating.credit_amount)
            .bind(compensating.invoice_id)
            .bind(compensating.created_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE wallets SET credits_balance = credits_balance + $2 WHERE id = $1")
            .bind(compensating.wallet_id)
            .bind(compensating.credit_amount)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(compensating)
    }

    pub async fn terminate(&self, wallet_id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE wallets SET status = $2 WHERE id = $1")
            .bind(wallet_id)
            .bind(WalletStatus::Terminated)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    fn sample_wallet(status: WalletStatus, balance: Decimal, currency: Currency) -> Wallet {
        Wallet {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            code: "main".into(),
            credits_balance: balance,
            rate_amount: dec!(1),
            currency,
            priority: 1,
            expiration_at: None,
            status,
        }
    }

    #[test]
    fn is_drawable_requires_active_and_positive_balance() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let active = sample_wallet(WalletStatus::Active, dec!(10), Currency::Usd);
        assert!(active.is_drawable(now));

        let empty = sample_wallet(WalletStatus::Active, Decimal::ZERO, Currency::Usd);
        assert!(!empty.is_drawable(now));

        let terminated = sample_wallet(WalletStatus::Terminated, dec!(10), Currency::Usd);
        assert!(!terminated.is_drawable(now));
    }
}
