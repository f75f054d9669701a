//! # ledgersync
//!
//! Keeps a document replica consistent with a relational ledger.
//!
//! Ledger mutations and their downstream effects commit atomically through
//! a transactional outbox. Relay workers lease outbox work with
//! compare-and-swap leases and apply it to the replica behind an
//! idempotency guard, retrying transient failures with capped exponential
//! backoff. A scheduled reconciliation sweep classifies divergence between
//! the two stores, repairs what it safely can and records an immutable
//! report with a health score.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod lease;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod outbox;
pub mod reconcile;
pub mod relay;
pub mod replica;
pub mod telemetry;
