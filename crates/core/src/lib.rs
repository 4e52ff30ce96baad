// Core crate clippy configuration
#![allow(clippy::too_many_arguments)] // invoice assembly takes the full rating context
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! bxb-core — BoxBilling's usage-based billing engine.
//!
//! ## Modules
//!
//! - **Ingestion**: [`events`] (idempotent ingest, plus [`events::BillingEventLogger`]
//!   — a non-persisted event-emission hook other modules call into),
//!   [`rate_limit`] (per-tenant sliding window), [`idempotency`] (at-most-once
//!   API mutation guarantee)
//! - **Rating**: [`aggregation`] (events -> usage value), [`charges`] (pure
//!   charge-model math), [`rating`] (aggregation + charges -> `Fee`)
//! - **Invoicing**: [`invoicing`] (assembly, coupons, wallet draws, taxes,
//!   the draft/finalized/paid/voided state machine)
//! - **Wallets**: [`wallet`] (top-up, debit, reverse, terminate)
//! - **Collections**: [`dunning`] (payment requests, retry), [`providers`]
//!   (narrow payment-gateway adapter)
//! - **Notifications**: [`usage_alerts`], [`webhooks`] (HMAC-signed outbox)
//! - **Platform**: [`auth`] (API keys, portal JWTs), [`runtime`] (explicit
//!   shared context), [`invariants`] (consistency checks), [`tasks`]
//!   (scheduled-job bodies, leased for idempotent double-runs)

pub mod aggregation;
pub mod auth;
pub mod charges;
pub mod dunning;
#[cfg(test)]
mod edge_case_tests;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod invariants;
pub mod invoicing;
pub mod model;
pub mod providers;
pub mod rate_limit;
pub mod rating;
pub mod runtime;
pub mod tasks;
pub mod usage_alerts;
pub mod wallet;
pub mod webhooks;

pub use aggregation::{AggregatedValue, AggregationEngine, CarriedState};
pub use auth::{ApiKey, ApiKeyManager, ApiKeyStatus, PortalClaims};
pub use dunning::DunningController;
pub use error::{CoreError, CoreResult};
pub use events::{BillingEventLogger, BillingEventType, EventStore, IngestResult, NewEvent};
pub use idempotency::{Claim, IdempotencyRecord, IdempotencyStatus, IdempotencyStore};
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity};
pub use invoicing::InvoiceAssembler;
pub use providers::{ChargeOutcome, ChargeRequest, ChargeResult, NullProvider, PaymentProvider};
pub use rate_limit::RateLimiter;
pub use rating::RatingInput;
pub use runtime::Runtime;
pub use tasks::TaskLeases;
pub use usage_alerts::UsageAlertEvaluator;
pub use wallet::WalletLedger;
pub use webhooks::WebhookDispatcher;

use sqlx::PgPool;
use std::sync::Arc;

/// Combines every sub-service over one pool and [`Runtime`] — each field
/// is independently constructible, this just wires the common ones.
pub struct CoreService {
    pub events: EventStore,
    pub billing_events: BillingEventLogger,
    pub aggregation: AggregationEngine,
    pub invoices: InvoiceAssembler,
    pub wallets: WalletLedger,
    pub dunning: DunningController,
    pub usage_alerts: UsageAlertEvaluator,
    pub webhooks: WebhookDispatcher,
    pub api_keys: ApiKeyManager,
    pub idempotency: IdempotencyStore,
    pub invariants: InvariantChecker,
    pub tasks: TaskLeases,
    pub runtime: Runtime,
}

impl CoreService {
    pub fn new(pool: PgPool, config: bxb_shared::Config, payment_provider: Arc<dyn PaymentProvider>) -> Self {
        let runtime = Runtime::new(pool.clone(), config, payment_provider);

        Self {
            events: EventStore::new(pool.clone(), RateLimiter::new(runtime.config.default_rate_limit_per_minute)),
            billing_events: BillingEventLogger::new(),
            aggregation: AggregationEngine::new(pool.clone()),
            invoices: InvoiceAssembler::new(pool.clone()),
            wallets: WalletLedger::new(pool.clone()),
            dunning: DunningController::new(pool.clone()),
            usage_alerts: UsageAlertEvaluator::new(pool.clone()),
            webhooks: WebhookDispatcher::new(pool.clone(), runtime.outbound_timeout),
            api_keys: ApiKeyManager::new(pool.clone()),
            idempotency: IdempotencyStore::new(pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            tasks: TaskLeases::new(pool),
            runtime,
        }
    }

    /// Constructs a `CoreService` with no payment gateway configured
    /// (self-hosted / test environments bill out-of-band).
    pub fn with_null_provider(pool: PgPool, config: bxb_shared::Config) -> Self {
        Self::new(pool, config, Arc::new(NullProvider))
    }
}
