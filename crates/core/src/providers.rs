//! Payment provider adapter (Non-goals: "Stripe/GoCardless/Adyen
//! are invoked through a narrow adapter interface, not embedded directly").
//! Concrete gateways implement `PaymentProvider`; nothing upstream of this
//! trait knows which one is configured.

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use bxb_shared::Currency;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    Succeeded,
    Declined,
}

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub payment_request_id: Uuid,
    pub customer_id: Uuid,
    pub amount_cents: i64,
    pub currency: Currency,
    pub external_payment_method_id: String,
}

#[derive(Debug, Clone)]
pub struct ChargeResult {
    pub outcome: ChargeOutcome,
    pub provider_reference: String,
}

/// A payment gateway integration. Every method is fallible with
/// `CoreError::Provider` for adapter-side failures and
/// `CoreError::Transient` for retryable network blips.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn charge(&self, request: ChargeRequest) -> CoreResult<ChargeResult>;
    async fn refund(&self, provider_reference: &str, amount_cents: i64) -> CoreResult<()>;
}

/// No-op adapter used in environments with no payment gateway configured
/// (tests, self-hosted instances billing out-of-band). Always declines,
/// never silently "succeeds" a real charge.
pub struct NullProvider;

#[async_trait]
impl PaymentProvider for NullProvider {
    async fn charge(&self, request: ChargeRequest) -> CoreResult<ChargeResult> {
        Err(CoreError::Provider(format!(
            "no payment provider configured, cannot charge payment_request {}",
            request.payment_request_id
        )))
    }

    async fn refund(&self, _provider_reference: &str, _amount_cents: i64) -> CoreResult<()> {
        Err(CoreError::Provider("no payment provider configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_provider_rejects_charges() {
        let provider = NullProvider;
        let result = provider
            .charge(ChargeRequest {
                payment_request_id: Uuid::new_v4(),
                customer_id: Uuid::new_v4(),
                amount_cents: 1_000,
                currency: Currency::Usd,
                external_payment_method_id: "pm_1".into(),
            })
            .await;
        assert!(result.is_err());
    }
}
