//! Postgres storage for the ML retention and caching engine.
//!
//! Each module maps one table to plain async query functions taking any
//! `PgExecutor`; `retention` holds the eviction criteria shared with the
//! in-memory backends.

pub mod aggregated;
pub mod features;
pub mod inference;
pub mod leases;
pub mod metrics;
pub mod migrate;
pub mod policies;
pub mod retention;
pub mod training;
pub mod types;

pub use retention::{EvictionCriteria, Retainable, RetentionView, TierColumns};
pub use sqlx::postgres::PgPool;
pub use types::*;
