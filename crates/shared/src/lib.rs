//! Shared primitives reused by `bxb-core` and `bxb-worker`: exact decimal
//! money, currency codes, environment configuration, and Postgres pool
//! bootstrap. Nothing here is tenant-scoped or billing-specific — that
//! lives in `bxb-core`.

pub mod config;
pub mod currency;
pub mod db;
pub mod money;

pub use config::Config;
pub use currency::Currency;
pub use db::{create_migration_pool, create_pool};
pub use money::{Money, RoundingFunction};
